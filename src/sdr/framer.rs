use bytes::{Buf, BytesMut};
use log::*;
use std::collections::VecDeque;
use std::fmt;
use tokio_util::codec;

use super::crc;
use super::dsp::{DcBlocker, Discriminator, Iq};

pub const BIT_RATE: u32 = 19_200;
pub const SYMBOL_SAMPLES: usize = 14;
pub const SAMPLE_RATE: u32 = BIT_RATE * SYMBOL_SAMPLES as u32;

/// Sync word that terminates the AA/55 training preamble.
pub const SYNC_WORD: u16 = 0xCB89;
pub const SYNC_BITS: usize = 16;

pub const FRAME_BITS: usize = SYNC_BITS + crc::PACKET_BYTES * 8;
pub const FRAME_SAMPLES: usize = FRAME_BITS * SYMBOL_SAMPLES;

// DC tracker time constant, in samples. Long against one frame so packet
// content does not drag the carrier-error estimate around.
const DC_ALPHA: f32 = 1.0 / 8192.0;

/// One CRC-validated sensor transmission.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub data: [u8; crc::PACKET_BYTES],
    /// Carrier offset of the transmitter relative to our tuned frequency,
    /// measured across this packet. Positive means the transmitter is high.
    pub freq_error_hz: f32,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{:+.0}Hz)", hex::encode(self.data), self.freq_error_hz)
    }
}

/// Decodes Davis FSK packets out of a raw 8-bit I/Q stream.
///
/// The stream is demodulated one sample at a time into a sliding window of
/// hard bit decisions. Whenever the window holds exactly one frame worth of
/// samples, the sync word is tested at mid-symbol positions; on a match the
/// 64 payload bits are packed (bytes arrive LSB-first) and gated by the
/// checksum. Frames that fail the checksum slide on by one sample, so a
/// sync-shaped run of noise costs nothing but the test.
pub struct PacketCodec {
    disc: Discriminator,
    dc: DcBlocker,
    // (hard bit, raw discriminator output) per sample, most recent last
    window: VecDeque<(u8, f32)>,
}

impl PacketCodec {
    pub fn new() -> PacketCodec {
        PacketCodec {
            disc: Discriminator::new(SAMPLE_RATE),
            dc: DcBlocker::new(DC_ALPHA),
            window: VecDeque::with_capacity(FRAME_SAMPLES + 1),
        }
    }

    fn sync_bit(k: usize) -> u8 {
        ((SYNC_WORD >> (SYNC_BITS - 1 - k)) & 1) as u8
    }

    /// Hard decision for symbol `k` of the window, sampled mid-symbol.
    fn symbol(&self, k: usize) -> u8 {
        self.window[k * SYMBOL_SAMPLES + SYMBOL_SAMPLES / 2].0
    }

    fn try_frame(&mut self) -> Option<Packet> {
        for k in 0..SYNC_BITS {
            if self.symbol(k) != Self::sync_bit(k) {
                return None;
            }
        }

        let mut data = [0u8; crc::PACKET_BYTES];
        for k in 0..crc::PACKET_BYTES * 8 {
            // LSB of each byte is transmitted first
            data[k / 8] |= self.symbol(SYNC_BITS + k) << (k % 8);
        }
        if !crc::frame_valid(&data) {
            trace!("sync word hit but checksum failed: {}", hex::encode(data));
            return None;
        }

        let freq_error_hz = self.disc.to_hz(self.cluster_midpoint());
        self.window.clear();
        Some(Packet {
            data,
            freq_error_hz,
        })
    }

    /// Midpoint of the mark/space discriminator clusters over the frame.
    ///
    /// Averaging the raw discriminator alone would bias the estimate by the
    /// frame's ones/zeros imbalance; the cluster midpoint does not care.
    fn cluster_midpoint(&self) -> f32 {
        let (mut hi, mut lo) = ((0.0f32, 0usize), (0.0f32, 0usize));
        for &(bit, raw) in &self.window {
            if bit != 0 {
                hi = (hi.0 + raw, hi.1 + 1);
            } else {
                lo = (lo.0 + raw, lo.1 + 1);
            }
        }
        if hi.1 == 0 || lo.1 == 0 {
            return 0.0;
        }
        (hi.0 / hi.1 as f32 + lo.0 / lo.1 as f32) / 2.0
    }
}

impl codec::Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.len() >= 2 {
            let pair = [src[0], src[1]];
            src.advance(2);

            let raw = self.disc.demod(Iq::from(&pair).to_complex());
            let sliced = self.dc.filter(raw);
            self.window.push_back(((sliced > 0.0) as u8, raw));

            if self.window.len() > FRAME_SAMPLES {
                self.window.pop_front();
            }
            if self.window.len() == FRAME_SAMPLES {
                if let Some(packet) = self.try_frame() {
                    trace!("framed packet {}", packet);
                    return Ok(Some(packet));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use tokio_util::codec::Decoder;

    const DEVIATION_HZ: f32 = 4_800.0;

    /// FSK-modulate a bit stream into dongle-format I/Q bytes.
    fn modulate(bits: &[u8], carrier_offset_hz: f32) -> BytesMut {
        let mut phase = 0.0f32;
        let mut out = BytesMut::new();
        for &bit in bits {
            let shift = if bit != 0 { DEVIATION_HZ } else { -DEVIATION_HZ };
            let step = 2.0 * PI * (carrier_offset_hz + shift) / SAMPLE_RATE as f32;
            for _ in 0..SYMBOL_SAMPLES {
                phase += step;
                out.extend_from_slice(&[
                    (127.5 + 110.0 * phase.cos()) as u8,
                    (127.5 + 110.0 * phase.sin()) as u8,
                ]);
            }
        }
        out
    }

    fn frame_bits(data: &[u8; 8]) -> Vec<u8> {
        let mut bits = Vec::new();
        // AA/55 training sequence ahead of the sync word
        for k in 0..32 {
            bits.push((k % 2 == 0) as u8);
        }
        for k in 0..SYNC_BITS {
            bits.push(PacketCodec::sync_bit(k));
        }
        for byte in data {
            for k in 0..8 {
                bits.push((byte >> k) & 1);
            }
        }
        // trailing idle
        for k in 0..32 {
            bits.push((k % 2 == 0) as u8);
        }
        bits
    }

    fn run(codec: &mut PacketCodec, mut src: BytesMut) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(p) = codec.decode(&mut src).unwrap() {
            out.push(p);
        }
        out
    }

    const DATA: [u8; 8] = [0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8];

    #[test]
    fn decodes_synthesized_packet() {
        let mut codec = PacketCodec::new();
        let packets = run(&mut codec, modulate(&frame_bits(&DATA), 0.0));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, DATA);
        assert!(packets[0].freq_error_hz.abs() < 300.0);
    }

    #[test]
    fn reports_carrier_offset() {
        let mut codec = PacketCodec::new();
        let packets = run(&mut codec, modulate(&frame_bits(&DATA), 2_000.0));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, DATA);
        assert!(
            (packets[0].freq_error_hz - 2_000.0).abs() < 400.0,
            "estimated {} Hz",
            packets[0].freq_error_hz
        );
    }

    #[test]
    fn corrupt_checksum_is_dropped() {
        let mut bad = DATA;
        bad[7] ^= 0x01;
        let mut codec = PacketCodec::new();
        assert!(run(&mut codec, modulate(&frame_bits(&bad), 0.0)).is_empty());
    }

    #[test]
    fn no_false_positives_on_noise() {
        // deterministic white-ish noise; must never frame a packet
        let mut state = 0x2545F491_4F6CDD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        };
        let mut src = BytesMut::new();
        for _ in 0..200_000 {
            src.extend_from_slice(&[next(), next()]);
        }
        let mut codec = PacketCodec::new();
        assert!(run(&mut codec, src).is_empty());
    }

    #[test]
    fn packet_split_across_reads() {
        let iq = modulate(&frame_bits(&DATA), 0.0);
        let mut codec = PacketCodec::new();
        let mut found = Vec::new();
        let mut buf = BytesMut::new();
        for chunk in iq.chunks(333) {
            // odd-sized reads leave a half sample pending in the buffer
            buf.extend_from_slice(chunk);
            while let Some(p) = codec.decode(&mut buf).unwrap() {
                found.push(p);
            }
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, DATA);
    }
}
