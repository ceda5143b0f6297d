//! Guest PCI address handling.
//!
//! The VMMs supported here report hotplugged devices on bus 0 with no
//! bridges, so a guest PCI path is just the slot decoded from the BDF.
//! Anything outside the `0000:00:XX.0` pattern is rejected; revisit when a
//! driver grows bridge topologies.

use vmpod_shared::{VmpodError, VmpodResult};

/// Decode `0000:00:XX.0` into the slot component (`XX`, lowercase hex).
pub fn slot_from_bdf(bdf: &str) -> VmpodResult<String> {
    let err = || VmpodError::UnexpectedPciAddress(bdf.to_string());

    let mut parts = bdf.split(':');
    let domain = parts.next().ok_or_else(err)?;
    let bus = parts.next().ok_or_else(err)?;
    let devfn = parts.next().ok_or_else(err)?;
    if parts.next().is_some() {
        return Err(err());
    }

    if domain != "0000" || bus != "00" {
        return Err(err());
    }

    let (slot, func) = devfn.split_once('.').ok_or_else(err)?;
    if func != "0" || slot.len() != 2 {
        return Err(err());
    }
    let slot_num = u8::from_str_radix(slot, 16).map_err(|_| err())?;
    if slot_num > 0x1f {
        return Err(err());
    }

    Ok(slot.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_slot_on_bus_zero() {
        assert_eq!(slot_from_bdf("0000:00:04.0").unwrap(), "04");
        assert_eq!(slot_from_bdf("0000:00:1f.0").unwrap(), "1f");
        assert_eq!(slot_from_bdf("0000:00:0A.0").unwrap(), "0a");
    }

    #[test]
    fn rejects_non_zero_bus_or_function() {
        for bad in [
            "0000:01:04.0",
            "0001:00:04.0",
            "0000:00:04.1",
            "0000:00:4.0",
            "0000:00:20.0",
            "00:04.0",
            "garbage",
            "0000:00:04.0:x",
        ] {
            let err = slot_from_bdf(bad).unwrap_err();
            assert_eq!(err.kind(), "UnexpectedPciAddress", "input: {}", bad);
        }
    }
}
