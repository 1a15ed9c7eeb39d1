//! Output device discovery and selection (thin CPAL wrappers).

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Print every output device, marking the host default.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.to_string());

    for device in host.output_devices().context("no output devices")? {
        let name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        if Some(&name) == default_name.as_ref() {
            println!("* {name}");
        } else {
            println!("  {name}");
        }
    }
    Ok(())
}

/// Pick an output device.
///
/// With `needle`, the first device whose name contains the substring
/// (case-insensitive) wins; otherwise the host default is used.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let lowered = needle.to_lowercase();
        let mut devices = host.output_devices().context("no output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| desc.to_string().to_lowercase().contains(&lowered))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("no output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}
