//! Post-recording conversion of MPEG-TS clips into MP4.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecodeOptions {
    /// Copy the elementary streams instead of re-encoding to H.264.
    pub remux_only: bool,
    /// Codec of the high-resolution stream as reported by ffprobe.
    pub codec_name: String,
}

/// Output path for a clip: `clip.ts` becomes `clip.mp4`.
pub fn mp4_path(input: &Path) -> Result<PathBuf> {
    match input.extension().and_then(|ext| ext.to_str()) {
        Some("ts") => Ok(input.with_extension("mp4")),
        _ => bail!("input file {} must have a .ts extension", input.display()),
    }
}

/// ffmpeg arguments converting `input` into `output` under `opts`.
pub fn recode_args(input: &Path, output: &Path, opts: &RecodeOptions) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-i".to_string(), input.display().to_string()];
    let codec_args: &[&str] = if !opts.remux_only {
        &["-c:v", "libx264", "-c:a", "aac"]
    } else if opts.codec_name == "hevc" {
        &["-c:v", "copy", "-c:a", "aac", "-tag:v", "hvc1", "-movflags", "+faststart"]
    } else {
        &["-c", "copy"]
    };
    args.extend(codec_args.iter().map(|arg| arg.to_string()));
    args.push(output.display().to_string());
    args
}

/// Convert a finished clip to MP4, deleting the `.ts` source only on success.
pub fn recode_to_mp4(input: &Path, opts: &RecodeOptions) -> Result<PathBuf> {
    let output = mp4_path(input)?;
    let result = Command::new("ffmpeg")
        .args(recode_args(input, &output, opts))
        .output()
        .context("failed to launch ffmpeg for re-encode")?;

    if !result.status.success() {
        bail!(
            "ffmpeg re-encode of {} failed ({}): {}",
            input.display(),
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        );
    }

    fs::remove_file(input)
        .with_context(|| format!("failed to remove {} after re-encode", input.display()))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ts_clips_are_accepted() {
        assert_eq!(
            mp4_path(Path::new("/clips/clip_abc.ts")).expect("ts input"),
            PathBuf::from("/clips/clip_abc.mp4")
        );
        assert!(mp4_path(Path::new("/clips/clip_abc.mkv")).is_err());
    }

    #[test]
    fn hevc_remux_tags_stream_for_players() {
        let opts = RecodeOptions {
            remux_only: true,
            codec_name: "hevc".into(),
        };
        let args = recode_args(Path::new("a.ts"), Path::new("a.mp4"), &opts);
        assert!(args.windows(2).any(|w| w == ["-tag:v", "hvc1"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert_eq!(args.last().map(String::as_str), Some("a.mp4"));
    }

    #[test]
    fn plain_remux_copies_everything() {
        let opts = RecodeOptions {
            remux_only: true,
            codec_name: "h264".into(),
        };
        let args = recode_args(Path::new("a.ts"), Path::new("a.mp4"), &opts);
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn full_recode_targets_h264() {
        let args = recode_args(Path::new("a.ts"), Path::new("a.mp4"), &RecodeOptions::default());
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
    }
}
