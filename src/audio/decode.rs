// audio/decode.rs
//
// Turns an input media file into a mono sample buffer. WAV is read directly;
// everything else is converted by FFmpeg to 16kHz mono f32.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::buffer::AudioBuffer;
use super::wav::read_wav;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Sample rate FFmpeg converts to
pub const DECODE_SAMPLE_RATE: u32 = 16000;

/// Locate FFmpeg: explicit override, then `SCRIBE_FFMPEG_PATH`, then PATH
pub fn find_ffmpeg_path(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!("Configured FFmpeg path does not exist: {}", path.display());
    }

    if let Ok(path) = std::env::var("SCRIBE_FFMPEG_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    which::which("ffmpeg").ok()
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Decode an input file. Blocking; run it off the async runtime.
pub fn decode_audio_file(path: &Path, ffmpeg_override: Option<&Path>) -> Result<AudioBuffer> {
    if !path.exists() {
        return Err(anyhow!("Audio file does not exist: {}", path.display()));
    }

    let buffer = if is_wav(path) {
        match read_wav(path) {
            Ok(buffer) => buffer,
            Err(e) => {
                // Some WAV variants (e.g. ADPCM) are not readable by hound
                warn!("Native WAV read failed, falling back to FFmpeg: {:#}", e);
                decode_with_ffmpeg(path, ffmpeg_override)?
            }
        }
    } else {
        decode_with_ffmpeg(path, ffmpeg_override)?
    };

    if buffer.is_empty() {
        return Err(anyhow!("Audio file contains no samples: {}", path.display()));
    }

    info!(
        "Decoded {} samples ({:.2} seconds) from {}",
        buffer.samples.len(),
        buffer.duration_seconds(),
        path.display()
    );
    Ok(buffer)
}

fn decode_with_ffmpeg(path: &Path, ffmpeg_override: Option<&Path>) -> Result<AudioBuffer> {
    let ffmpeg_path = find_ffmpeg_path(ffmpeg_override)
        .ok_or_else(|| anyhow!("FFmpeg not found. Please install FFmpeg."))?;
    debug!("Using FFmpeg at: {:?}", ffmpeg_path);

    let mut command = Command::new(&ffmpeg_path);

    #[cfg(target_os = "windows")]
    command.creation_flags(CREATE_NO_WINDOW);

    command
        .arg("-nostdin")
        .arg("-hide_banner")
        .arg("-nostats")
        .arg("-i")
        .arg(path)
        .arg("-f")
        .arg("f32le")
        .arg("-acodec")
        .arg("pcm_f32le")
        .arg("-ar")
        .arg(DECODE_SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg("1")
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // wait_with_output drains stdout and stderr together, so a chatty stderr
    // cannot fill its pipe while we block on stdout
    let output = command
        .spawn()
        .context("Failed to spawn FFmpeg process")?
        .wait_with_output()
        .context("Failed to read FFmpeg output")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("FFmpeg decode failed: {}", stderr);
        return Err(anyhow!("FFmpeg failed to decode audio: {}", stderr.trim()));
    }

    let raw_bytes = output.stdout;
    if raw_bytes.len() % 4 != 0 {
        return Err(anyhow!(
            "Invalid audio data length: {} bytes (not divisible by 4)",
            raw_bytes.len()
        ));
    }

    let samples = raw_bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Ok(AudioBuffer::new(samples, DECODE_SAMPLE_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_wav;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_an_error() {
        let err = decode_audio_file(Path::new("/nonexistent/audio.wav"), None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_wav_is_read_without_ffmpeg() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.WAV");
        write_wav(&path, &vec![0.1; 8000], 8000).unwrap();

        let buffer = decode_audio_file(&path, Some(Path::new("/nonexistent/ffmpeg"))).unwrap();
        assert_eq!(buffer.sample_rate, 8000);
        assert!((buffer.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_wav_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_wav(&path, &[], 16000).unwrap();

        assert!(decode_audio_file(&path, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_chatty_ffmpeg_stderr_does_not_stall_decode() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tempdir().unwrap();
        // Far more stderr than a pipe buffer holds, then one f32 sample (1.0)
        let fake = dir.path().join("ffmpeg");
        std::fs::write(
            &fake,
            "#!/bin/sh\nhead -c 200000 /dev/zero | tr '\\0' 'w' >&2\nprintf '\\000\\000\\200\\077'\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("input.mp3");
        std::fs::write(&input, b"not really mp3").unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(decode_audio_file(&input, Some(&fake)));
        });

        let buffer = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("decode stalled on a full stderr pipe")
            .unwrap();
        assert_eq!(buffer.sample_rate, DECODE_SAMPLE_RATE);
        assert_eq!(buffer.samples, vec![1.0]);
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_failure_reports_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\necho 'Invalid data found' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("input.m4a");
        std::fs::write(&input, b"junk").unwrap();

        let err = decode_audio_file(&input, Some(&fake)).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid data found"));
    }
}
