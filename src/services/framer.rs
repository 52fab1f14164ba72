//! Packet framer - byte stream to validated packets
//!
//! Consumes raw transport chunks and emits checksum-valid frames. Three
//! modes, chosen from the port's packet parameters:
//!
//! 1. Fixed length (`rx_length` set): slice and validate.
//! 2. Delimited (header and footer known): scan for the earliest footer
//!    position where the whole frame validates.
//! 3. Schema-probed (neither): try candidate frame lengths derived from the
//!    entity catalog, shortest first.
//!
//! On any invalid candidate the framer advances by exactly one byte, so an
//! embedded valid packet is never lost to a bad resync. Single-writer: only
//! the transport read task calls `push`.

use crate::domain::types::Packet;
use crate::infra::config::PacketDefaults;
use bytes::{Buf, BytesMut};

/// Upper bound on how long a frame can get before the framer starts
/// dropping bytes to resynchronize.
const MAX_FRAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fixed(usize),
    Delimited,
    Probed,
}

pub struct Framer {
    params: PacketDefaults,
    mode: Mode,
    /// Candidate full-frame lengths for probed mode, ascending.
    probe_lengths: Vec<usize>,
    buf: BytesMut,
    dropped_total: u64,
}

impl Framer {
    pub fn new(params: PacketDefaults, mut probe_lengths: Vec<usize>) -> Self {
        let mode = if let Some(len) = params.rx_length {
            Mode::Fixed(len)
        } else if !params.rx_header.is_empty() && !params.rx_footer.is_empty() {
            Mode::Delimited
        } else {
            Mode::Probed
        };
        probe_lengths.sort_unstable();
        probe_lengths.dedup();
        Self { params, mode, probe_lengths, buf: BytesMut::with_capacity(256), dropped_total: 0 }
    }

    /// Total bytes discarded during resynchronization.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_total
    }

    /// Feed a chunk; returns every complete valid packet it unlocked.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(chunk);
        let mut packets = Vec::new();
        match self.mode {
            Mode::Fixed(len) => self.pump_fixed(len, &mut packets),
            Mode::Delimited => self.pump_delimited(&mut packets),
            Mode::Probed => self.pump_probed(&mut packets),
        }
        packets
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.advance(n);
        self.dropped_total += n as u64;
    }

    fn emit(&mut self, len: usize, packets: &mut Vec<Packet>) {
        let frame = self.buf.split_to(len);
        packets.push(Packet::new(frame.to_vec()));
    }

    fn pump_fixed(&mut self, len: usize, packets: &mut Vec<Packet>) {
        while self.buf.len() >= len {
            if validate_frame(&self.params, &self.buf[..len]) {
                self.emit(len, packets);
            } else {
                self.drop_front(1);
            }
        }
    }

    fn pump_delimited(&mut self, packets: &mut Vec<Packet>) {
        let header = self.params.rx_header.clone();
        let footer = self.params.rx_footer.clone();
        let min_len = self.min_frame_len();

        'outer: loop {
            self.sync_to_header();
            if self.buf.len() < min_len {
                return;
            }
            // Try every header occurrence as a frame start; noise can
            // contain stray header bytes, and a valid embedded frame must
            // come out as soon as it is fully buffered.
            let starts: Vec<usize> = self
                .buf
                .windows(header.len())
                .enumerate()
                .filter(|(_, w)| *w == &header[..])
                .map(|(i, _)| i)
                .collect();
            for start in starts {
                if start + min_len > self.buf.len() {
                    break;
                }
                for end in start + min_len..=self.buf.len() {
                    if self.buf[end - footer.len()..end] == footer[..]
                        && validate_frame(&self.params, &self.buf[start..end])
                    {
                        if start > 0 {
                            self.drop_front(start);
                        }
                        self.emit(end - start, packets);
                        continue 'outer;
                    }
                }
            }
            // Nothing validates yet. Wait for more bytes unless the window
            // is already implausibly long.
            if self.buf.len() > MAX_FRAME_LEN {
                self.drop_front(1);
                continue;
            }
            return;
        }
    }

    fn pump_probed(&mut self, packets: &mut Vec<Packet>) {
        let candidates: Vec<usize> = if self.probe_lengths.is_empty() {
            (self.min_frame_len().max(1)..=MAX_FRAME_LEN).collect()
        } else {
            self.probe_lengths.clone()
        };
        let shortest = match candidates.first() {
            Some(&len) => len,
            None => return,
        };

        'outer: loop {
            self.sync_to_header();
            if self.buf.len() < shortest {
                return;
            }
            for &len in &candidates {
                if self.buf.len() < len {
                    break;
                }
                if validate_frame(&self.params, &self.buf[..len]) {
                    self.emit(len, packets);
                    continue 'outer;
                }
            }
            let longest = *candidates.last().unwrap_or(&MAX_FRAME_LEN);
            if self.buf.len() >= longest {
                self.drop_front(1);
                continue;
            }
            return;
        }
    }

    /// Discard bytes preceding the next header occurrence. With no header
    /// configured this is a no-op.
    fn sync_to_header(&mut self) {
        let header = &self.params.rx_header;
        if header.is_empty() || self.buf.is_empty() {
            return;
        }
        if let Some(pos) = self
            .buf
            .windows(header.len().min(self.buf.len()))
            .position(|w| w == &header[..w.len()])
        {
            if pos > 0 {
                self.drop_front(pos);
            }
        } else {
            // Keep a potential partial header tail.
            let keep = header.len().saturating_sub(1).min(self.buf.len());
            let discard = self.buf.len() - keep;
            if discard > 0 {
                self.drop_front(discard);
            }
        }
    }

    fn min_frame_len(&self) -> usize {
        self.params.rx_header.len()
            + self.params.rx_footer.len()
            + self.params.rx_checksum.len()
            + self.params.rx_checksum2.len()
            + 1
    }
}

/// Header prefix, footer suffix and checksum trailer must all hold.
pub fn validate_frame(params: &PacketDefaults, frame: &[u8]) -> bool {
    let header = &params.rx_header;
    let footer = &params.rx_footer;
    let c1_len = params.rx_checksum.len();
    let c2_len = params.rx_checksum2.len();
    let overhead = header.len() + footer.len() + c1_len + c2_len;
    if frame.len() < overhead {
        return false;
    }
    if !frame.starts_with(header) {
        return false;
    }
    if !frame.ends_with(footer) {
        return false;
    }
    let trailer_end = frame.len() - footer.len();
    let c2_start = trailer_end - c2_len;
    let c1_start = c2_start - c1_len;
    let body = &frame[header.len()..c1_start];
    if !params.rx_checksum.verify(header, body, &frame[c1_start..c2_start]) {
        return false;
    }
    params
        .rx_checksum2
        .verify(header, body, &frame[c1_start..c2_start], &frame[c2_start..trailer_end])
}

/// Strip header, footer and checksum bytes from a validated frame.
pub fn frame_body<'a>(params: &PacketDefaults, frame: &'a [u8]) -> Option<&'a [u8]> {
    if !validate_frame(params, frame) {
        return None;
    }
    let start = params.rx_header.len();
    let end = frame.len()
        - params.rx_footer.len()
        - params.rx_checksum.len()
        - params.rx_checksum2.len();
    Some(&frame[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::checksum::Checksum;

    fn ezville_params() -> PacketDefaults {
        PacketDefaults {
            rx_header: vec![0xF7],
            rx_footer: vec![0xEE],
            rx_checksum: Checksum::Add,
            ..Default::default()
        }
    }

    /// Frame layout: F7 <body> <add checksum> EE.
    fn ezville_frame(body: &[u8]) -> Vec<u8> {
        let params = ezville_params();
        let mut frame = params.rx_header.clone();
        frame.extend_from_slice(body);
        frame.extend(params.rx_checksum.compute(&params.rx_header, body));
        frame.extend_from_slice(&params.rx_footer);
        frame
    }

    #[test]
    fn test_delimited_happy_path() {
        let mut framer = Framer::new(ezville_params(), Vec::new());
        let frame = ezville_frame(&[0x30, 0x01, 0x00]);
        let packets = framer.push(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
        assert_eq!(framer.dropped_bytes(), 0);
    }

    #[test]
    fn test_delimited_resync_through_noise() {
        let mut framer = Framer::new(ezville_params(), Vec::new());
        let frame = ezville_frame(&[0x30, 0x01, 0x00]);
        let mut stream = vec![0x00, 0x12, 0xF7, 0x99]; // noise, incl. a stray header byte
        stream.extend_from_slice(&frame);
        let mut packets = Vec::new();
        for chunk in stream.chunks(3) {
            packets.extend(framer.push(chunk));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
    }

    #[test]
    fn test_delimited_chunked_delivery() {
        let mut framer = Framer::new(ezville_params(), Vec::new());
        let frame = ezville_frame(&[0x30, 0x01, 0x00, 0x42]);
        let mut packets = Vec::new();
        for &byte in &frame {
            packets.extend(framer.push(&[byte]));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
    }

    #[test]
    fn test_delimited_footer_byte_inside_body() {
        // Body contains the footer byte 0xEE; checksum validation rejects
        // the early end and the framer keeps scanning.
        let mut framer = Framer::new(ezville_params(), Vec::new());
        let frame = ezville_frame(&[0x30, 0xEE, 0x01]);
        let packets = framer.push(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
    }

    #[test]
    fn test_fixed_length_mode() {
        let params = PacketDefaults {
            rx_length: Some(6),
            rx_header: vec![0xF7],
            rx_checksum: Checksum::Add,
            ..Default::default()
        };
        // Frame: F7 30 01 00 25 <sum>; footer empty, 6 bytes total.
        let body = [0x30, 0x01, 0x00, 0x25];
        let mut frame = vec![0xF7];
        frame.extend_from_slice(&body);
        frame.extend(Checksum::Add.compute(&[0xF7], &body));
        let mut framer = Framer::new(params, Vec::new());

        let mut stream = vec![0x55]; // one byte of leading noise
        stream.extend_from_slice(&frame);
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
        assert_eq!(framer.dropped_bytes(), 1);
    }

    #[test]
    fn test_fixed_length_bad_checksum_drops_one_byte() {
        let params = PacketDefaults {
            rx_length: Some(4),
            rx_checksum: Checksum::AddNoHeader,
            ..Default::default()
        };
        let mut framer = Framer::new(params, Vec::new());
        // Corrupt frame then a valid one.
        let good_body = [0x10, 0x20, 0x30];
        let mut good = good_body.to_vec();
        good.extend(Checksum::AddNoHeader.compute(&[], &good_body));
        let mut stream = vec![0x10, 0x20, 0x30, 0xFF]; // bad checksum
        stream.extend_from_slice(&good);
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, good);
        assert!(framer.dropped_bytes() >= 1);
    }

    #[test]
    fn test_probed_mode_shortest_wins() {
        let params = PacketDefaults {
            rx_header: vec![0xAA],
            rx_checksum: Checksum::Xor,
            ..Default::default()
        };
        // Candidate lengths 4 and 6; craft a stream where the 4-byte frame
        // validates. Frame: AA B0 B1 <xor>.
        let body = [0xB0, 0xB1];
        let mut frame = vec![0xAA];
        frame.extend_from_slice(&body);
        frame.extend(Checksum::Xor.compute(&[0xAA], &body));
        assert_eq!(frame.len(), 4);

        let mut framer = Framer::new(params, vec![4, 6]);
        let packets = framer.push(&frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
    }

    #[test]
    fn test_probed_mode_waits_for_longer_candidate() {
        let params = PacketDefaults {
            rx_header: vec![0xAA],
            rx_checksum: Checksum::Xor,
            ..Default::default()
        };
        let body = [0x01, 0x02, 0x03, 0x04];
        let mut frame = vec![0xAA];
        frame.extend_from_slice(&body);
        frame.extend(Checksum::Xor.compute(&[0xAA], &body));
        assert_eq!(frame.len(), 6);

        let mut framer = Framer::new(params, vec![4, 6]);
        // First 4 bytes: no valid 4-byte frame, must not emit garbage.
        assert!(framer.push(&frame[..4]).is_empty());
        let packets = framer.push(&frame[4..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].raw, frame);
    }

    #[test]
    fn test_samsung_frame_validation() {
        // Samsung RX vector from the protocol reference: body 30 01 00 00 00
        // has checksum 0x01.
        let params = PacketDefaults {
            rx_length: Some(6),
            rx_checksum: Checksum::SamsungRx,
            ..Default::default()
        };
        assert!(validate_frame(&params, &[0x30, 0x01, 0x00, 0x00, 0x00, 0x01]));
        assert!(!validate_frame(&params, &[0x30, 0x01, 0x00, 0x00, 0x00, 0x02]));
    }

    #[test]
    fn test_frame_body_strips_overhead() {
        let params = ezville_params();
        let frame = ezville_frame(&[0x30, 0x01, 0x00]);
        assert_eq!(frame_body(&params, &frame), Some(&[0x30u8, 0x01, 0x00][..]));
        assert_eq!(frame_body(&params, &[0xF7, 0x30]), None);
    }

    #[test]
    fn test_resync_cost_is_bounded() {
        // Property: packet emitted after at most len(noise) + len(frame)
        // consumed bytes.
        let mut framer = Framer::new(ezville_params(), Vec::new());
        let frame = ezville_frame(&[0x30, 0x01, 0x00]);
        let noise = vec![0xF7, 0x00, 0xF7, 0x01, 0x55];
        let mut stream = noise.clone();
        stream.extend_from_slice(&frame);
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 1);
        assert!(framer.dropped_bytes() <= noise.len() as u64);
    }
}
