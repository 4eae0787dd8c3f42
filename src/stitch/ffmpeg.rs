use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{StitchRequest, StitchedAudio, Stitcher};
use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::session::ContainerHint;

/// Target chunk length; stitched output is verified against this
const EXPECTED_CHUNK_SECS: f32 = 30.0;
const DURATION_TOLERANCE_SECS: f32 = 5.0;
const SHORT_OUTPUT_SECS: f32 = 5.0;

/// ffmpeg-backed stitcher with a three-strategy ladder:
///
/// 1. Filter-graph concat for multi-fragment WebM: every fragment is a
///    separate input, decoded through one `concat` filter so the shared
///    EBML header from the first fragment applies to all of them.
/// 2. Per-fragment transcode to MP3 intermediates, then concat-demuxer
///    stream copy. Individual fragment failures are skipped, not fatal.
/// 3. One streaming pipe over the concatenated bytes, for single
///    fragments and self-framing containers.
///
/// If everything fails the original bytes are forwarded with their
/// original container hint; the transcriber may still reject them.
pub struct FfmpegStitcher {
    tool_timeout: Duration,
    filter_graph_timeout: Duration,
    stdout_max: usize,
}

impl FfmpegStitcher {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            tool_timeout: config.tool_timeout(),
            filter_graph_timeout: config.filter_graph_timeout(),
            stdout_max: config.tool_stdout_max,
        }
    }

    async fn filter_graph_concat(&self, req: &StitchRequest<'_>) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("combined.mp3");

        let mut args: Vec<OsString> = base_args();
        for path in req.paths {
            args.extend(input_args(ContainerHint::WebmOpus));
            args.push(path.as_os_str().to_owned());
        }

        let n = req.paths.len();
        let mut filter = String::new();
        for i in 0..n {
            filter.push_str(&format!("[{}:a]", i));
        }
        filter.push_str(&format!("concat=n={}:v=0:a=1[out]", n));

        args.extend(["-filter_complex".into(), filter.into()]);
        args.extend(["-map".into(), "[out]".into()]);
        args.extend(encode_args());
        args.push(out.as_os_str().to_owned());

        run_tool("ffmpeg", &args, None, self.filter_graph_timeout, self.stdout_max).await?;
        self.verify_output(&out).await?;
        Ok(tokio::fs::read(&out).await?)
    }

    async fn transcode_then_concat(&self, req: &StitchRequest<'_>) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let mut parts: Vec<std::path::PathBuf> = Vec::new();

        for (i, (path, hint)) in req.paths.iter().zip(req.hints).enumerate() {
            let part = dir.path().join(format!("part-{:03}.mp3", i));
            let mut args: Vec<OsString> = base_args();
            args.extend(input_args(*hint));
            args.push(path.as_os_str().to_owned());
            args.extend(encode_args());
            args.push(part.as_os_str().to_owned());

            match run_tool("ffmpeg", &args, None, self.tool_timeout, self.stdout_max).await {
                Ok(_) => {
                    if part_nonempty(&part).await {
                        parts.push(part);
                    } else {
                        debug!("Fragment {} transcoded to empty output, skipping", path.display());
                    }
                }
                Err(e) => debug!("Fragment {} failed to transcode, skipping: {}", path.display(), e),
            }
        }

        if parts.is_empty() {
            return Err(ProcessorError::StitchFailed(
                "every fragment failed to transcode".to_string(),
            ));
        }

        if parts.len() == 1 {
            let out = &parts[0];
            self.verify_output(out).await?;
            return Ok(tokio::fs::read(out).await?);
        }

        let list = dir.path().join("concat.txt");
        let mut listing = String::new();
        for part in &parts {
            listing.push_str(&format!("file '{}'\n", part.display()));
        }
        tokio::fs::write(&list, listing).await?;

        let out = dir.path().join("combined.mp3");
        let mut args: Vec<OsString> = base_args();
        args.extend(["-f".into(), "concat".into(), "-safe".into(), "0".into()]);
        args.extend(["-i".into(), list.as_os_str().to_owned()]);
        args.extend(["-c".into(), "copy".into(), "-f".into(), "mp3".into(), "-y".into()]);
        args.push(out.as_os_str().to_owned());

        run_tool("ffmpeg", &args, None, self.tool_timeout, self.stdout_max).await?;
        self.verify_output(&out).await?;
        Ok(tokio::fs::read(&out).await?)
    }

    async fn stream_pipe(&self, req: &StitchRequest<'_>) -> Result<Vec<u8>> {
        let combined = req.combined_bytes();
        let mut args: Vec<OsString> = base_args();
        args.extend(["-i".into(), "pipe:0".into()]);
        args.extend([
            "-ar".into(),
            "16000".into(),
            "-ac".into(),
            "1".into(),
            "-b:a".into(),
            "64k".into(),
            "-f".into(),
            "mp3".into(),
            "pipe:1".into(),
        ]);

        let bytes = run_tool(
            "ffmpeg",
            &args,
            Some(combined.as_slice()),
            self.tool_timeout,
            self.stdout_max,
        )
        .await?;
        if bytes.is_empty() {
            return Err(ProcessorError::StitchFailed(
                "streaming pipe produced no output".to_string(),
            ));
        }

        // Write out for the duration probe; forwarding does not depend on it
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("combined.mp3");
        tokio::fs::write(&out, &bytes).await?;
        self.verify_output(&out).await?;
        Ok(bytes)
    }

    /// Post-strategy verification: non-empty output, and when ffprobe is
    /// available, a duration sanity check against the chunk period.
    async fn verify_output(&self, path: &Path) -> Result<()> {
        let len = tokio::fs::metadata(path).await?.len();
        if len == 0 {
            return Err(ProcessorError::StitchFailed(format!(
                "stitched output {} is empty",
                path.display()
            )));
        }

        match probe_duration(path).await {
            Some(duration) => {
                if duration < SHORT_OUTPUT_SECS {
                    warn!(
                        "Stitched output {} is only {:.1}s, forwarding anyway",
                        path.display(),
                        duration
                    );
                } else if (duration - EXPECTED_CHUNK_SECS).abs() > DURATION_TOLERANCE_SECS {
                    warn!(
                        "Stitched output {} is {:.1}s, expected ~{:.0}s",
                        path.display(),
                        duration,
                        EXPECTED_CHUNK_SECS
                    );
                }
            }
            None => debug!("ffprobe unavailable, skipping duration check"),
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Stitcher for FfmpegStitcher {
    async fn stitch(&self, request: StitchRequest<'_>) -> Result<StitchedAudio> {
        let all_webm = request.hints.iter().all(|h| h.is_webm());

        if request.paths.len() > 1 && all_webm {
            match self.filter_graph_concat(&request).await {
                Ok(bytes) => {
                    return Ok(StitchedAudio {
                        bytes,
                        mime_type: "audio/mpeg".to_string(),
                    })
                }
                Err(e) => warn!(
                    "Filter-graph concat failed for session {}: {}",
                    request.session_id, e
                ),
            }

            match self.transcode_then_concat(&request).await {
                Ok(bytes) => {
                    return Ok(StitchedAudio {
                        bytes,
                        mime_type: "audio/mpeg".to_string(),
                    })
                }
                Err(e) => warn!(
                    "Transcode-then-concat failed for session {}: {}",
                    request.session_id, e
                ),
            }
        }

        match self.stream_pipe(&request).await {
            Ok(bytes) => {
                return Ok(StitchedAudio {
                    bytes,
                    mime_type: "audio/mpeg".to_string(),
                })
            }
            Err(e) => warn!(
                "Streaming pipe failed for session {}: {}",
                request.session_id, e
            ),
        }

        // Last resort: forward the raw bytes under their original hint.
        // The transcriber may reject them; that is reported, not retried.
        let hint = request.hints.first().copied().unwrap_or(ContainerHint::WebmOpus);
        warn!(
            "All stitch strategies failed for session {}, forwarding {} original bytes as {}",
            request.session_id,
            request.payloads.iter().map(|p| p.len()).sum::<usize>(),
            hint.mime_type()
        );
        Ok(StitchedAudio {
            bytes: request.combined_bytes(),
            mime_type: hint.mime_type().to_string(),
        })
    }
}

fn base_args() -> Vec<OsString> {
    vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
    ]
}

/// Per-input flags: forced demuxer, permissive error handling, timestamp
/// regeneration for fragments that lost their cluster timestamps.
fn input_args(hint: ContainerHint) -> Vec<OsString> {
    vec![
        "-err_detect".into(),
        "ignore_err".into(),
        "-fflags".into(),
        "+genpts+discardcorrupt".into(),
        "-f".into(),
        demuxer(hint).into(),
        "-i".into(),
    ]
}

fn encode_args() -> Vec<OsString> {
    vec![
        "-ar".into(),
        "16000".into(),
        "-ac".into(),
        "1".into(),
        "-b:a".into(),
        "64k".into(),
        "-f".into(),
        "mp3".into(),
        "-y".into(),
    ]
}

fn demuxer(hint: ContainerHint) -> &'static str {
    match hint {
        ContainerHint::WebmOpus => "webm",
        ContainerHint::OggOpus => "ogg",
        ContainerHint::Mp3 => "mp3",
        ContainerHint::Mp4 => "mp4",
        ContainerHint::Aac => "aac",
        ContainerHint::Flac => "flac",
        ContainerHint::Wav => "wav",
    }
}

async fn part_nonempty(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false)
}

/// Cap on captured stderr; `-loglevel error` keeps it far below this
const STDERR_MAX: u64 = 64 * 1024;

/// Spawn an external tool. The stdin feed and the stdout/stderr drains run
/// concurrently (feeding the whole input before reading would deadlock
/// once the child fills its stdout pipe buffer), everything is bounded by
/// the timeout, and stdout is capped as it streams in: the child is killed
/// the moment its output exceeds `stdout_max`.
async fn run_tool(
    program: &str,
    args: &[OsString],
    stdin: Option<&[u8]>,
    timeout: Duration,
    stdout_max: usize,
) -> Result<Vec<u8>> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        ProcessorError::StitchFailed(format!("failed to spawn {}: {}", program, e))
    })?;

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let feed = async move {
        if let Some(mut pipe) = stdin_pipe {
            if let Some(input) = stdin {
                // ffmpeg may close its input early once it has a full
                // stream; a broken pipe here is not a failure.
                if let Err(e) = pipe.write_all(input).await {
                    debug!("{} closed stdin early: {}", program, e);
                }
            }
            let _ = pipe.shutdown().await;
        }
        Ok::<_, ProcessorError>(())
    };

    let read_out = async move {
        let mut out = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = pipe.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if out.len() + n > stdout_max {
                    return Err(ProcessorError::StitchFailed(format!(
                        "{} exceeded the {} byte output cap",
                        program, stdout_max
                    )));
                }
                out.extend_from_slice(&buf[..n]);
            }
        }
        Ok::<_, ProcessorError>(out)
    };

    let read_err = async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe {
            let _ = pipe.take(STDERR_MAX).read_to_end(&mut buf).await;
        }
        Ok::<_, ProcessorError>(buf)
    };

    let outcome = tokio::time::timeout(timeout, async {
        let (_, stdout_buf, stderr_buf) = tokio::try_join!(feed, read_out, read_err)?;
        let status = child.wait().await?;
        Ok::<_, ProcessorError>((status, stdout_buf, stderr_buf))
    })
    .await;

    let (status, stdout_buf, stderr_buf) = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e);
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(ProcessorError::StitchFailed(format!(
                "{} timed out after {:?}",
                program, timeout
            )));
        }
    };

    if !status.success() {
        return Err(ProcessorError::StitchFailed(format!(
            "{} exited with {}: {}",
            program,
            status,
            String::from_utf8_lossy(&stderr_buf).trim()
        )));
    }

    Ok(stdout_buf)
}

/// Duration via ffprobe; None when the tool is unavailable or fails
async fn probe_duration(path: &Path) -> Option<f32> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}
