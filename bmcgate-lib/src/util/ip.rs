use std::net::{IpAddr, Ipv4Addr};

/// Render a client address as a string, collapsing IPv4-mapped IPv6
/// addresses back to plain IPv4.
pub fn to_string(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Verify that `mask` is a dotted-quad IPv4 string and, when it is a
/// contiguous netmask, return its prefix length.
///
/// Returns `None` for strings that don't parse as IPv4 or for
/// non-contiguous masks such as `255.0.255.0`.
pub fn ipv4_mask_bits(mask: &str) -> Option<u8> {
    let addr: Ipv4Addr = mask.parse().ok()?;

    let mut prefix: u8 = 0;
    let mut mask_finished = false;
    for byte in addr.octets() {
        if mask_finished {
            if byte != 0 {
                return None;
            }
            continue;
        }
        match byte {
            255 => prefix += 8,
            254 => {
                prefix += 7;
                mask_finished = true;
            }
            252 => {
                prefix += 6;
                mask_finished = true;
            }
            248 => {
                prefix += 5;
                mask_finished = true;
            }
            240 => {
                prefix += 4;
                mask_finished = true;
            }
            224 => {
                prefix += 3;
                mask_finished = true;
            }
            192 => {
                prefix += 2;
                mask_finished = true;
            }
            128 => {
                prefix += 1;
                mask_finished = true;
            }
            0 => mask_finished = true,
            _ => return None,
        }
    }
    Some(prefix)
}
