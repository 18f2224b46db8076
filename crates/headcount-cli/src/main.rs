use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use headcount_core::{
    DetectionBackend, DetectionRequest, DeterministicMock, Pipeline, UploadedFile, WireResponse,
    YoloDetector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "headcount", about = "Classroom headcount from photos", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Yolo,
    Mock,
}

#[derive(Subcommand)]
enum Commands {
    /// Count faces in a local image
    Detect {
        /// Image file (png, jpg, jpeg, gif, bmp, webp)
        path: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Backend::Yolo)]
        backend: Backend,
        /// ONNX model for the yolo backend
        #[arg(short, long, default_value = "models/yolov8n-face.onnx")]
        model: PathBuf,
        /// Comma-separated model class names (e.g. "person,face")
        #[arg(long, value_delimiter = ',')]
        classes: Vec<String>,
        /// Seed for repeatable mock output
        #[arg(long)]
        seed: Option<u64>,
        /// Write the annotated JPEG here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the full JSON response
        #[arg(long)]
        json: bool,
    },
    /// Estimate a headcount from a reported meal count
    Estimate {
        #[arg(short, long)]
        reported: i64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show daemon health
    Health {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// List images stored by the daemon
    Uploads {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            path,
            backend,
            model,
            classes,
            seed,
            output,
            json,
        } => {
            let backend: Arc<dyn DetectionBackend> = match backend {
                Backend::Yolo => Arc::new(
                    YoloDetector::load(&model.to_string_lossy(), classes)
                        .context("failed to load YOLO model")?,
                ),
                Backend::Mock => Arc::new(DeterministicMock::new(seed)),
            };
            let response = detect_file(Pipeline::new(backend), &path)?;

            if let Some(output) = &output {
                let image = response
                    .image()
                    .context("response carries no annotated image")?;
                std::fs::write(output, image.jpeg())
                    .with_context(|| format!("failed to write {}", output.display()))?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_summary(&response);
                if let Some(output) = &output {
                    println!("Annotated image: {}", output.display());
                }
            }
        }
        Commands::Estimate { reported, seed } => {
            let pipeline = Pipeline::new(Arc::new(DeterministicMock::new(seed)))
                .with_estimator(DeterministicMock::new(seed));
            let response = pipeline
                .run(DetectionRequest::Reported(reported))
                .map_err(|f| anyhow::anyhow!(f))?;
            println!("Estimated headcount: {} (reported {reported})", response.count());
        }
        Commands::Health { server } => {
            let body = get_json(&server, "/health")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Uploads { server } => {
            let body = get_json(&server, "/list-uploads")?;
            let files = body["files"].as_array().cloned().unwrap_or_default();
            if files.is_empty() {
                println!("No uploads stored");
            }
            for file in files {
                println!(
                    "{}  {:>10} bytes  {}",
                    file["uploaded_at"].as_str().unwrap_or("-"),
                    file["size"].as_u64().unwrap_or(0),
                    file["filename"].as_str().unwrap_or("?"),
                );
            }
        }
    }

    Ok(())
}

fn detect_file(pipeline: Pipeline, path: &Path) -> Result<WireResponse> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image read");
    pipeline
        .run(DetectionRequest::upload(Some(UploadedFile { filename, bytes })))
        .map_err(|failure| {
            let body = failure.error_response();
            match body.details {
                Some(details) => anyhow::anyhow!("{}: {details}", body.error),
                None => anyhow::anyhow!(body.error),
            }
        })
}

fn print_summary(response: &WireResponse) {
    let mode = if response.is_mock() { " (mock)" } else { "" };
    println!("Detected {} faces{mode}", response.count());
    for (i, face) in response.detections().iter().enumerate() {
        let [x1, y1, x2, y2] = face.bbox.to_array();
        println!(
            "  Face {:>2}: [{x1:.0}, {y1:.0}, {x2:.0}, {y2:.0}]  confidence {:.2}",
            i + 1,
            face.confidence
        );
    }
}

fn get_json(server: &str, path: &str) -> Result<serde_json::Value> {
    let url = format!("{}{path}", server.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client
        .get(&url)
        .send()
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    let body: serde_json::Value = response.json().context("invalid JSON from daemon")?;
    if !status.is_success() {
        bail!(
            "{url} returned {status}: {}",
            body["error"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(body)
}
