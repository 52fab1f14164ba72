//! Vendor checksum algorithms for homenet packet frames
//!
//! Every supported wall-pad vendor trails its frames with one or two
//! checksum bytes. The algorithm is declared per port (and overridable per
//! entity) in the packet parameters. All arithmetic is mod 256.

use serde::{Deserialize, Serialize};

/// Single-byte (or, for `xor_add`, two-byte) frame checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// No checksum trailer.
    #[default]
    None,
    /// Sum of header and body bytes.
    Add,
    /// Sum of body bytes only.
    AddNoHeader,
    /// XOR of header and body bytes.
    Xor,
    /// XOR of body bytes only.
    XorNoHeader,
    /// Samsung SDS receive checksum: seeded 0xB0, XOR body, toggle 0x80
    /// when the first body byte is below 0x7C.
    SamsungRx,
    /// Samsung SDS transmit checksum: XOR body, then toggle 0x80.
    SamsungTx,
    /// Two-byte trailer: XOR byte followed by (sum + xor) byte.
    XorAdd,
}

/// Secondary checksum trailer, appended after the primary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum2 {
    #[default]
    None,
    /// Two-byte xor_add over everything preceding it (header, body and
    /// the primary checksum byte).
    XorAdd,
}

impl Checksum {
    /// Number of trailer bytes this algorithm occupies.
    pub fn len(self) -> usize {
        match self {
            Checksum::None => 0,
            Checksum::XorAdd => 2,
            _ => 1,
        }
    }

    pub fn is_none(self) -> bool {
        self == Checksum::None
    }

    /// Compute the checksum trailer for `header || body`.
    ///
    /// The `*_no_header` and Samsung variants ignore `header`.
    pub fn compute(self, header: &[u8], body: &[u8]) -> Vec<u8> {
        match self {
            Checksum::None => Vec::new(),
            Checksum::Add => vec![sum(header).wrapping_add(sum(body))],
            Checksum::AddNoHeader => vec![sum(body)],
            Checksum::Xor => vec![xor(header) ^ xor(body)],
            Checksum::XorNoHeader => vec![xor(body)],
            Checksum::SamsungRx => {
                let mut c = 0xB0u8;
                for &b in body {
                    c ^= b;
                }
                if body.first().is_some_and(|&b| b < 0x7C) {
                    c ^= 0x80;
                }
                vec![c]
            }
            Checksum::SamsungTx => vec![xor(body) ^ 0x80],
            Checksum::XorAdd => {
                let t = xor(header) ^ xor(body);
                let s = sum(header).wrapping_add(sum(body)).wrapping_add(t);
                vec![t, s]
            }
        }
    }

    /// Validate a checksum trailer against `header || body`.
    pub fn verify(self, header: &[u8], body: &[u8], trailer: &[u8]) -> bool {
        if trailer.len() != self.len() {
            return false;
        }
        self.compute(header, body) == trailer
    }
}

impl Checksum2 {
    pub fn len(self) -> usize {
        match self {
            Checksum2::None => 0,
            Checksum2::XorAdd => 2,
        }
    }

    pub fn is_none(self) -> bool {
        self == Checksum2::None
    }

    /// Compute over everything preceding the trailer: header, body and the
    /// already-computed primary checksum bytes.
    pub fn compute(self, header: &[u8], body: &[u8], checksum1: &[u8]) -> Vec<u8> {
        match self {
            Checksum2::None => Vec::new(),
            Checksum2::XorAdd => {
                let t = xor(header) ^ xor(body) ^ xor(checksum1);
                let s = sum(header)
                    .wrapping_add(sum(body))
                    .wrapping_add(sum(checksum1))
                    .wrapping_add(t);
                vec![t, s]
            }
        }
    }

    pub fn verify(self, header: &[u8], body: &[u8], checksum1: &[u8], trailer: &[u8]) -> bool {
        if trailer.len() != self.len() {
            return false;
        }
        self.compute(header, body, checksum1) == trailer
    }
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_includes_header() {
        let header = [0xF7];
        let body = [0x30, 0x01, 0x00];
        // 0xF7 + 0x30 + 0x01 = 0x128 -> 0x28
        assert_eq!(Checksum::Add.compute(&header, &body), vec![0x28]);
        assert_eq!(Checksum::AddNoHeader.compute(&header, &body), vec![0x31]);
    }

    #[test]
    fn test_xor_variants() {
        let header = [0xAA];
        let body = [0x0F, 0xF0];
        assert_eq!(Checksum::Xor.compute(&header, &body), vec![0xAA ^ 0x0F ^ 0xF0]);
        assert_eq!(Checksum::XorNoHeader.compute(&header, &body), vec![0x0F ^ 0xF0]);
    }

    #[test]
    fn test_samsung_rx_reference_vector() {
        // Body 30 01 00 00 00: c = 0xB0 ^ 0x30 ^ 0x01 = 0x81, body[0] < 0x7C
        // toggles 0x80, giving 0x01.
        let body = [0x30, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(Checksum::SamsungRx.compute(&[], &body), vec![0x01]);
    }

    #[test]
    fn test_samsung_rx_high_first_byte_keeps_toggle_off() {
        let body = [0x7C, 0x01];
        assert_eq!(Checksum::SamsungRx.compute(&[], &body), vec![0xB0 ^ 0x7C ^ 0x01]);
    }

    #[test]
    fn test_samsung_tx() {
        let body = [0x30, 0x01];
        assert_eq!(Checksum::SamsungTx.compute(&[], &body), vec![0x30 ^ 0x01 ^ 0x80]);
    }

    #[test]
    fn test_xor_add_two_bytes() {
        let header = [0x02];
        let body = [0x10, 0x20];
        let t = 0x02 ^ 0x10 ^ 0x20;
        let s = 0x02u8.wrapping_add(0x10).wrapping_add(0x20).wrapping_add(t);
        assert_eq!(Checksum::XorAdd.compute(&header, &body), vec![t, s]);
        assert_eq!(Checksum::XorAdd.len(), 2);
    }

    #[test]
    fn test_round_trip_all_modes() {
        let header = [0xF7, 0x0B];
        let body = [0x01, 0x1F, 0x81, 0x00, 0x55];
        for mode in [
            Checksum::None,
            Checksum::Add,
            Checksum::AddNoHeader,
            Checksum::Xor,
            Checksum::XorNoHeader,
            Checksum::SamsungRx,
            Checksum::SamsungTx,
            Checksum::XorAdd,
        ] {
            let trailer = mode.compute(&header, &body);
            assert_eq!(trailer.len(), mode.len());
            assert!(mode.verify(&header, &body, &trailer), "round trip failed for {mode:?}");
        }
    }

    #[test]
    fn test_checksum2_round_trip() {
        let header = [0xF7];
        let body = [0x30, 0x01];
        let c1 = Checksum::Add.compute(&header, &body);
        let c2 = Checksum2::XorAdd.compute(&header, &body, &c1);
        assert_eq!(c2.len(), 2);
        assert!(Checksum2::XorAdd.verify(&header, &body, &c1, &c2));
        assert!(!Checksum2::XorAdd.verify(&header, &body, &c1, &[0, 0]));
    }

    #[test]
    fn test_verify_rejects_wrong_length() {
        assert!(!Checksum::Add.verify(&[], &[0x01], &[]));
        assert!(!Checksum::XorAdd.verify(&[], &[0x01], &[0x01]));
        assert!(Checksum::None.verify(&[], &[0x01], &[]));
    }

    #[test]
    fn test_empty_body_samsung_rx() {
        assert_eq!(Checksum::SamsungRx.compute(&[], &[]), vec![0xB0]);
    }
}
