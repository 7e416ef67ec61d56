//! G.711 µ-law (PCMU) für den Audio-Track
//!
//! Mikrofon-Frames kommen mit 48 kHz (20ms = 960 Samples) und werden auf
//! 8 kHz heruntergerechnet, ein Byte pro Sample.

use std::time::Duration;

/// Dauer eines Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

pub const PCMU_CLOCK_RATE: u32 = 8000;

const INPUT_RATE: u32 = 48_000;
const DECIMATION: usize = (INPUT_RATE / PCMU_CLOCK_RATE) as usize;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Ein Sample (-1.0 bis 1.0) als µ-law Byte
fn encode_sample(sample: f32) -> u8 {
    let pcm = (sample.clamp(-1.0, 1.0) * 32_767.0) as i32;
    let sign = if pcm < 0 { 0x80 } else { 0x00 };
    let magnitude = pcm.abs().min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// 48 kHz Frame -> 8 kHz µ-law (Mittelwert je 6 Samples)
pub fn encode_frame(frame: &[f32]) -> Vec<u8> {
    frame
        .chunks(DECIMATION)
        .map(|chunk| encode_sample(chunk.iter().sum::<f32>() / chunk.len() as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codewords() {
        assert_eq!(encode_sample(0.0), 0xFF);
        assert_eq!(encode_sample(1.0), 0x80);
        assert_eq!(encode_sample(-1.0), 0x00);
        // Übersteuerung wird begrenzt
        assert_eq!(encode_sample(4.0), encode_sample(1.0));
    }

    #[test]
    fn test_frame_is_decimated() {
        let frame = vec![0.0f32; 960];
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.len(), 160);
        assert!(encoded.iter().all(|b| *b == 0xFF));
    }
}
