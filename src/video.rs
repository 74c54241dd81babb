//! Frame extraction and video assembly through `ffmpeg`.
//!
//! Decoding goes through a raw `rgb24` pipe so that frame selection and
//! numbering happen here rather than in an ffmpeg filter graph.

use std::{
    ffi::OsString,
    fs,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Output, Stdio},
};

use anyhow::Result;
use image::RgbImage;
use tracing::{debug, info};

use crate::SError;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Keep source frames whose 0-based index is a multiple of this.
    pub every_nth: usize,
    pub width: u32,
    pub height: u32,
    /// Clear and extract again when the frames directory already exists.
    pub overwrite: bool,
    pub extension: String,
    pub ffmpeg: PathBuf,
}

/// Extracts the frames of `video` into `frames_dir` as `00001.<ext>`, `00002.<ext>`, ...
/// and returns how many frames the directory holds.
pub fn extract_frames(video: &Path, frames_dir: &Path, options: &ExtractOptions) -> Result<usize> {
    if frames_dir.exists() && !options.overwrite {
        let count = list_frames(frames_dir, &options.extension)?.len();
        info!("frames already unpacked: {count} in {}", frames_dir.display());
        return Ok(count);
    }
    if !video.exists() {
        return Err(SError::MissingVideo(video.to_path_buf()).into());
    }
    fs::create_dir_all(frames_dir)?;
    clear_frames(frames_dir, &options.extension)?;

    let mut cmd = Command::new(&options.ffmpeg);
    cmd.arg("-v")
        .arg("error")
        .arg("-nostdin")
        .arg("-i")
        .arg(video)
        .arg("-vf")
        .arg(format!("scale={}:{}", options.width, options.height))
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);
    let written = decode_frames(cmd, options, frames_dir)?;
    info!("converted {} into {written} frames", video.display());
    Ok(written)
}

/// Runs `cmd`, reads raw frames from its stdout and writes the selected ones.
pub fn decode_frames(mut cmd: Command, options: &ExtractOptions, frames_dir: &Path) -> Result<usize> {
    if options.every_nth == 0 {
        anyhow::bail!("frame subsampling factor should be at least 1")
    }
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("running {cmd:?}");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SError::Spawn {
            program: program.clone(),
            source,
        })?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SError::String("child stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or(SError::String("child stderr was not captured"))?;
    // Drained on its own thread, a full stderr pipe would stall the decoder.
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let frames = RawFrameReader::new(stdout, options.width, options.height);
    let written = match write_subsampled(frames, options.every_nth, frames_dir, &options.extension) {
        Ok(written) => written,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stderr_reader.join();
            return Err(err);
        }
    };

    let status = child.wait()?;
    let stderr = stderr_reader
        .join()
        .map_err(|_| SError::String("stderr reader panicked"))?;
    if !status.success() {
        return Err(command_failed(program, status, &stderr).into());
    }
    Ok(written)
}

/// Writes every `every_nth` frame (0-based) as `{t:05}.{ext}`, `t` counting from 1.
pub fn write_subsampled<I>(frames: I, every_nth: usize, dir: &Path, ext: &str) -> Result<usize>
where
    I: IntoIterator<Item = Result<RgbImage>>,
{
    if every_nth == 0 {
        anyhow::bail!("frame subsampling factor should be at least 1")
    }
    let mut written = 0;
    for (idx, frame) in frames.into_iter().enumerate() {
        let frame = frame?;
        if idx % every_nth != 0 {
            continue;
        }
        written += 1;
        frame.save(dir.join(format!("{written:05}.{ext}")))?;
    }
    Ok(written)
}

/// Iterates over fixed-size `rgb24` frames.
pub struct RawFrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    done: bool,
}

impl<R: Read> RawFrameReader<R> {
    pub fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            done: false,
        }
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl<R: Read> Iterator for RawFrameReader<R> {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let expected = self.frame_len();
        let mut buf = vec![0u8; expected];
        let mut filled = 0;
        while filled < expected {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < expected {
            self.done = true;
            return Some(Err(SError::TruncatedFrame {
                expected,
                got: filled,
            }
            .into()));
        }
        let frame: Result<RgbImage> = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| SError::String("raw frame has a malformed shape").into());
        Some(frame)
    }
}

fn is_frame(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

/// Numbered frame files of `dir`, in order.
pub fn list_frames(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_frame(p, ext))
        .collect();
    frames.sort();
    Ok(frames)
}

fn clear_frames(dir: &Path, ext: &str) -> Result<()> {
    for frame in list_frames(dir, ext)? {
        fs::remove_file(frame)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub ffmpeg: PathBuf,
    pub fps: f64,
    pub start_number: usize,
    /// printf-style input pattern, e.g. `out/batch_%05d.png`.
    pub pattern: PathBuf,
    pub max_frames: usize,
    pub crf: u8,
    pub output: PathBuf,
}

pub fn encoder_args(options: &EncodeOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-vcodec".into(),
        "png".into(),
        "-r".into(),
        options.fps.to_string().into(),
        "-start_number".into(),
        options.start_number.to_string().into(),
        "-i".into(),
        options.pattern.clone().into(),
        "-frames:v".into(),
        options.max_frames.to_string().into(),
        "-c:v".into(),
        "libx264".into(),
        "-vf".into(),
        format!("fps={}", options.fps).into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-crf".into(),
        options.crf.to_string().into(),
        "-preset".into(),
        "veryfast".into(),
    ];
    args.push(options.output.clone().into());
    args
}

/// Assembles numbered frames into a video, returning the video path.
pub fn encode_video(options: &EncodeOptions) -> Result<PathBuf> {
    info!(
        "encoding {} into {}",
        options.pattern.display(),
        options.output.display()
    );
    let mut cmd = Command::new(&options.ffmpeg);
    cmd.args(encoder_args(options));
    run_command(cmd)?;
    Ok(options.output.clone())
}

/// Runs `cmd` to completion; a nonzero exit carries the captured stderr.
pub fn run_command(mut cmd: Command) -> Result<Output, SError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("running {cmd:?}");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(command_failed(program, output.status, &output.stderr));
    }
    Ok(output)
}

fn command_failed(program: String, status: ExitStatus, stderr: &[u8]) -> SError {
    SError::CommandFailed {
        program,
        status,
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}
