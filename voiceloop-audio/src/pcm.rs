/// Decodes little-endian 16-bit PCM into samples in [-1, 1).
///
/// A trailing odd byte is dropped.
pub fn s16le_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Encodes samples as little-endian 16-bit PCM, clipping out-of-range input.
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Averages interleaved channels into one.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn decodes_known_values() {
        let x = s16le_to_f32(&[0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F, 0x01]);
        assert_eq!(x.len(), 3);
        assert_abs_diff_eq!(x[0], 0.5);
        assert_abs_diff_eq!(x[1], -0.5);
        assert_abs_diff_eq!(x[2], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn encoding_clips_and_is_exact_for_pcm_values() {
        assert_eq!(f32_to_s16le(&[2.0, -2.0]), vec![0xFF, 0x7F, 0x00, 0x80]);

        let pcm: Vec<u8> = [-32768i16, -1, 0, 1, 12345, 32767]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(f32_to_s16le(&s16le_to_f32(&pcm)), pcm);
    }

    #[test]
    fn downmix_averages_frames() {
        let mono = downmix_to_mono(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 3);
        assert_abs_diff_eq!(mono[0], 0.5);
        assert_abs_diff_eq!(mono[1], 0.5);
        assert_abs_diff_eq!(mono[2], 0.0);
        assert_eq!(downmix_to_mono(&[0.25], 1), vec![0.25]);
    }
}
