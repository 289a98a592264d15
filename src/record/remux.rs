//! Container remuxers: copy an H.264 elementary stream into MP4 without
//! re-encoding.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::Remuxer;
use crate::error::{CaptureError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `ffmpeg -y -framerate <fps> -i <raw> -c copy <output>`.
#[derive(Clone, Debug)]
pub struct FfmpegCliRemuxer {
    program: PathBuf,
    timeout: Duration,
}

impl Default for FfmpegCliRemuxer {
    fn default() -> Self {
        Self::new("ffmpeg", Duration::from_secs(60))
    }
}

impl FfmpegCliRemuxer {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, raw: &Path, output: &Path, fps: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-y")
            .args(["-loglevel", "error"])
            .arg("-framerate")
            .arg(fps.max(1).to_string())
            .arg("-i")
            .arg(raw)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Remuxer for FfmpegCliRemuxer {
    fn remux(&self, raw: &Path, output: &Path, fps: u32) -> Result<()> {
        let mut child = self.command(raw, output, fps).spawn().map_err(|err| {
            CaptureError::Encoder(format!("spawn {}: {}", self.program.display(), err))
        })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Encoder(format!(
                    "{} timed out after {:?}",
                    self.program.display(),
                    self.timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if status.success() {
            log::debug!("remuxed {} -> {}", raw.display(), output.display());
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Err(CaptureError::Encoder(format!(
            "{} exited with {}: {}",
            self.program.display(),
            status,
            stderr.trim()
        )))
    }
}

/// Copies the raw stream verbatim. For synthetic streams, which no real
/// muxer can parse.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyRemuxer;

impl Remuxer for CopyRemuxer {
    fn remux(&self, raw: &Path, output: &Path, _fps: u32) -> Result<()> {
        std::fs::copy(raw, output)?;
        Ok(())
    }
}

#[cfg(feature = "remux-ffmpeg")]
pub use self::in_process::FfmpegRemuxer;

#[cfg(feature = "remux-ffmpeg")]
mod in_process {
    use ffmpeg_next as ffmpeg;
    use std::path::Path;

    use super::super::Remuxer;
    use crate::error::{CaptureError, Result};

    /// In-process stream copy through libavformat.
    #[derive(Clone, Debug)]
    pub struct FfmpegRemuxer;

    impl FfmpegRemuxer {
        pub fn new() -> Result<Self> {
            ffmpeg::init().map_err(|err| CaptureError::Encoder(format!("initialize ffmpeg: {}", err)))?;
            Ok(Self)
        }
    }

    fn av(context: &str) -> impl Fn(ffmpeg::Error) -> CaptureError + '_ {
        move |err| CaptureError::Encoder(format!("{}: {}", context, err))
    }

    impl Remuxer for FfmpegRemuxer {
        fn remux(&self, raw: &Path, output: &Path, fps: u32) -> Result<()> {
            let mut options = ffmpeg::Dictionary::new();
            options.set("framerate", &fps.max(1).to_string());
            let mut input = ffmpeg::format::input_with_dictionary(&raw, options).map_err(av("open raw stream"))?;
            let mut output_ctx = ffmpeg::format::output(&output).map_err(av("open container"))?;

            let mut mapping = vec![None; input.nb_streams() as usize];
            let mut time_bases = vec![ffmpeg::Rational(0, 1); input.nb_streams() as usize];
            let mut next_index = 0usize;
            for (index, stream) in input.streams().enumerate() {
                if stream.parameters().medium() != ffmpeg::media::Type::Video {
                    continue;
                }
                let mut out_stream = output_ctx
                    .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
                    .map_err(av("add output stream"))?;
                out_stream.set_parameters(stream.parameters());
                mapping[index] = Some(next_index);
                time_bases[index] = stream.time_base();
                next_index += 1;
            }
            if next_index == 0 {
                return Err(CaptureError::Encoder(format!("{} has no video stream", raw.display())));
            }

            output_ctx.write_header().map_err(av("write container header"))?;
            for (stream, mut packet) in input.packets() {
                let Some(out_index) = mapping[stream.index()] else {
                    continue;
                };
                let out_time_base = output_ctx
                    .stream(out_index)
                    .map(|s| s.time_base())
                    .ok_or_else(|| CaptureError::Encoder("output stream vanished".to_string()))?;
                packet.rescale_ts(time_bases[stream.index()], out_time_base);
                packet.set_position(-1);
                packet.set_stream(out_index);
                packet
                    .write_interleaved(&mut output_ctx)
                    .map_err(av("write packet"))?;
            }
            output_ctx.write_trailer().map_err(av("write container trailer"))?;
            Ok(())
        }
    }
}
