//! Devices command: list attached USB devices as the runtime sees them.

use anyhow::Context;
use plughost_config::Config;
use plughost_devices::{DeviceEnumerator, DeviceInfo, SysfsEnumerator, usb_subject_id};

use crate::theme::Theme;

/// Enumerate devices under the configured sysfs root.
pub(crate) fn list(config: &Config) -> anyhow::Result<()> {
    let enumerator = SysfsEnumerator::new(&config.devices.sysfs_root);
    let devices = enumerator.enumerate().with_context(|| {
        format!(
            "failed to enumerate devices under {}",
            config.devices.sysfs_root.display()
        )
    })?;

    println!("\n{}", Theme::header("USB Devices"));
    if devices.is_empty() {
        println!("  {}", Theme::dimmed("(none)"));
    }
    for device in &devices {
        println!("  {}", row(device));
    }
    println!();
    Ok(())
}

fn row(device: &DeviceInfo) -> String {
    let attrs = &device.attributes;
    let id = match (attrs.vendor_id, attrs.product_id) {
        (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
        _ => "????:????".to_string(),
    };
    let product = attrs.product.as_deref().unwrap_or("-");
    format!(
        "{}  {id}  {product:<32} {}",
        device.key,
        Theme::dimmed(&usb_subject_id(attrs))
    )
}

#[cfg(test)]
mod tests {
    use plughost_devices::DeviceAttributes;

    use super::*;

    #[test]
    fn row_shows_ids_and_key() {
        let device = DeviceInfo::new(
            1,
            4,
            DeviceAttributes {
                vendor_id: Some(0x1234),
                product_id: Some(0xabcd),
                product: Some("Sensor".into()),
                ..Default::default()
            },
        );
        let row = row(&device);
        assert!(row.starts_with("001/004  1234:abcd  Sensor"));
    }

    #[test]
    fn missing_ids_are_marked() {
        let device = DeviceInfo::new(2, 9, DeviceAttributes::default());
        assert!(row(&device).contains("????:????"));
    }
}
