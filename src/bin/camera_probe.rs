//! camera_probe - open one camera with the full fallback logic and grab a frame
//!
//! Prints the negotiated stream info and source metrics, optionally writing the
//! frame (capped to the snapshot size) as a JPEG.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crossline::config::infer_kind;
use crossline::frame::{DEFAULT_JPEG_QUALITY, MAX_SNAPSHOT_HEIGHT, MAX_SNAPSHOT_WIDTH};
use crossline::ingest::redact_uri;
use crossline::{open_capture, Backend, SourceKind, SourceSpec, Transport};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URI (rtsp://, http://, /dev/videoN or stub://name).
    #[arg(long)]
    uri: String,
    /// Source kind; inferred from the URI when omitted.
    #[arg(long, value_parser = ["rtsp", "http", "local"])]
    kind: Option<String>,
    /// Initial RTSP transport.
    #[arg(long, default_value = "tcp", value_parser = ["tcp", "udp"])]
    transport: String,
    /// Backend to try, repeatable, in priority order.
    #[arg(long = "backend")]
    backends: Vec<String>,
    /// Write the captured frame to this JPEG file.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Seconds to wait for the first frame.
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,
    /// Skip downscaling to the snapshot size.
    #[arg(long)]
    full_size: bool,
    /// JPEG quality for --out.
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    quality: u8,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let kind = match args.kind.as_deref() {
        Some("rtsp") => SourceKind::Rtsp,
        Some("http") => SourceKind::Http,
        Some("local") => SourceKind::Local,
        Some(other) => return Err(anyhow!("unknown source kind '{}'", other)),
        None => infer_kind(&args.uri),
    };
    let transport = if args.transport == "udp" {
        Transport::Udp
    } else {
        Transport::Tcp
    };
    let priority = args
        .backends
        .iter()
        .map(|name| Backend::from_str(name))
        .collect::<Result<Vec<_>>>()?;
    if !(args.timeout.is_finite() && args.timeout > 0.0) {
        return Err(anyhow!("--timeout must be a positive number of seconds"));
    }
    let timeout = Duration::from_secs_f64(args.timeout);

    let spec = SourceSpec::new(args.uri.clone(), kind).with_transport(transport);
    println!("probing {} ({:?}, {})", redact_uri(&args.uri), kind, transport.as_str());

    let started = Instant::now();
    let mut source = open_capture(&spec, &priority).map_err(|err| anyhow!("{}", err))?;
    let opened_in = started.elapsed();
    let read = source.read(timeout);
    let info = source.info();
    let metrics = source.metrics();
    let diagnostics = source.diagnostics();
    source.close();

    println!("backend:   {}", source.backend());
    println!("opened in: {:.2}s", opened_in.as_secs_f64());
    println!(
        "stream:    {}x{} @ {:.1} fps codec={} transport={}",
        info.width,
        info.height,
        info.fps,
        info.codec.as_deref().unwrap_or("-"),
        info.transport.map(Transport::as_str).unwrap_or("-")
    );
    println!(
        "metrics:   frames_in={} frames_out={} reconnects={} in_fps={:.1} out_fps={:.1}",
        metrics.frames_in, metrics.frames_out, metrics.reconnect_count, metrics.in_fps, metrics.out_fps
    );

    let frame = match read {
        Ok(frame) => frame,
        Err(err) => {
            for line in diagnostics {
                println!("decoder:   {}", line);
            }
            return Err(anyhow!("no frame within {:.1}s: {}", args.timeout, err));
        }
    };
    println!("frame:     #{} {}x{}", frame.seq, frame.width, frame.height);

    if let Some(path) = &args.out {
        let frame = if args.full_size {
            frame
        } else {
            frame.downscale_to_fit(MAX_SNAPSHOT_WIDTH, MAX_SNAPSHOT_HEIGHT)?
        };
        let jpeg = frame.encode_jpeg(args.quality)?;
        std::fs::write(path, &jpeg).with_context(|| format!("write {}", path.display()))?;
        println!("wrote {} ({} bytes, {}x{})", path.display(), jpeg.len(), frame.width, frame.height);
    }
    Ok(())
}
