use std::path::Path;

use crate::domain::transcript::AudioRef;

/// 発話フレーム判定の RMS 閾値
const SPEECH_RMS_THRESHOLD: f32 = 0.02;
/// 1フレームの長さ (ms)
const FRAME_MS: u32 = 20;

/// 入力音声のプローブ結果（`vad` ステージの出力）。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioProbe {
    /// 再生時間（WAV 以外は `None`）
    pub duration_secs: Option<f64>,
    /// RMS が閾値を超えたフレームの割合（WAV 以外は `None`）
    pub speech_ratio: Option<f32>,
    pub size_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Input file not found: {0}")]
    NotFound(String),
    #[error("Input file is not readable: {0}")]
    Unreadable(String),
    #[error("Input file is empty: {0}")]
    Empty(String),
}

/// 入力ファイルの存在と読み取り可否を確認し、WAV なら長さと発話率を測る。
///
/// WAV ヘッダが壊れている場合は致命的にせず、メタデータなしで返す。
/// 文字起こしエンジンは他のフォーマットも受け付けるため。
pub fn probe(audio: &AudioRef) -> Result<AudioProbe, ProbeError> {
    let display = audio.path.display().to_string();
    let metadata = std::fs::metadata(&audio.path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProbeError::NotFound(display.clone())
        } else {
            ProbeError::Unreadable(format!("{display}: {e}"))
        }
    })?;
    if !metadata.is_file() {
        return Err(ProbeError::Unreadable(format!("{display}: not a regular file")));
    }
    if metadata.len() == 0 {
        return Err(ProbeError::Empty(display));
    }

    let mut probe = AudioProbe {
        size_bytes: metadata.len(),
        ..Default::default()
    };

    if is_wav(&audio.path) {
        match measure_wav(&audio.path) {
            Ok((duration, ratio)) => {
                probe.duration_secs = Some(duration);
                probe.speech_ratio = Some(ratio);
            }
            Err(e) => log::warn!("WAV ヘッダを読めません ({display}): {e}"),
        }
    }

    Ok(probe)
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
}

/// (再生秒数, 発話フレーム率) を返す。
fn measure_wav(path: &Path) -> Result<(f64, f32), hound::Error> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let duration = if spec.sample_rate == 0 {
        0.0
    } else {
        reader.duration() as f64 / spec.sample_rate as f64
    };

    let frame_len = ((spec.sample_rate * FRAME_MS / 1000) as usize * spec.channels as usize).max(1);
    let mut meter = FrameMeter::new(frame_len);

    match spec.sample_format {
        hound::SampleFormat::Float => {
            for s in reader.samples::<f32>() {
                meter.push(s?);
            }
        }
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            for s in reader.samples::<i32>() {
                meter.push(s? as f32 / scale);
            }
        }
    }

    Ok((duration, meter.speech_ratio()))
}

/// フレーム単位の RMS を数える。
struct FrameMeter {
    frame_len: usize,
    filled: usize,
    sum_sq: f32,
    frames: u64,
    speech_frames: u64,
}

impl FrameMeter {
    fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            filled: 0,
            sum_sq: 0.0,
            frames: 0,
            speech_frames: 0,
        }
    }

    fn push(&mut self, sample: f32) {
        self.sum_sq += sample * sample;
        self.filled += 1;
        if self.filled == self.frame_len {
            self.close_frame();
        }
    }

    fn close_frame(&mut self) {
        let rms = (self.sum_sq / self.filled as f32).sqrt();
        self.frames += 1;
        if rms >= SPEECH_RMS_THRESHOLD {
            self.speech_frames += 1;
        }
        self.filled = 0;
        self.sum_sq = 0.0;
    }

    fn speech_ratio(mut self) -> f32 {
        if self.filled > 0 {
            self.close_frame();
        }
        if self.frames == 0 {
            0.0
        } else {
            self.speech_frames as f32 / self.frames as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, seconds: u32, amplitude: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..(16_000 * seconds) {
            let v = if i % 2 == 0 { amplitude } else { -amplitude };
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn probes_wav_duration_and_speech() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loud.wav");
        write_wav(&path, 2, 0.1);

        let p = probe(&AudioRef::new(&path)).unwrap();
        assert_eq!(p.duration_secs, Some(2.0));
        assert!(p.speech_ratio.unwrap() > 0.99);
        assert!(p.size_bytes > 0);
    }

    #[test]
    fn silent_wav_has_zero_speech_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.wav");
        write_wav(&path, 1, 0.0);

        let p = probe(&AudioRef::new(&path)).unwrap();
        assert_eq!(p.speech_ratio, Some(0.0));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = probe(&AudioRef::new("/nonexistent/meeting.wav")).unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = tempfile::Builder::new().suffix(".mp3").tempfile().unwrap();
        let err = probe(&AudioRef::new(file.path())).unwrap_err();
        assert!(matches!(err, ProbeError::Empty(_)));
    }

    #[test]
    fn non_wav_has_no_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meeting.m4a");
        std::fs::write(&path, b"not really audio").unwrap();

        let p = probe(&AudioRef::new(&path)).unwrap();
        assert_eq!(p.duration_secs, None);
        assert_eq!(p.size_bytes, 16);
    }

    #[test]
    fn corrupt_wav_header_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"RIFF....garbage").unwrap();

        let p = probe(&AudioRef::new(&path)).unwrap();
        assert_eq!(p.duration_secs, None);
    }
}
