use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{jpeg, people, FaceRecord, Peak, Person};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face cache client")]
struct Cli {
    /// Base URL of the facewatchd gateway
    #[arg(long, env = "FACEWATCH_URL", default_value = "http://127.0.0.1:9081", global = true)]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached faces
    Faces,
    /// Show one cached face
    Face {
        /// Cache index
        index: i32,
        /// Also save the face image here
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Save the most recent video frame
    Frame {
        #[arg(short, long, default_value = "frame.jpg")]
        output: PathBuf,
    },
    /// Show cluster peaks
    Peaks,
    /// Classify a photo and add the person to a roster file
    Enroll {
        /// Photo of the person's face (any format the image crate reads)
        photo: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "people.json")]
        people: PathBuf,
    },
}

/// Thin wrapper over the gateway's HTTP routes.
struct Gateway {
    http: reqwest::Client,
    base: String,
}

impl Gateway {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        read_body(resp).await
    }

    async fn post_face(&self, jpeg: Vec<u8>) -> Result<Vec<f32>> {
        let url = self.url("face");
        tracing::debug!(%url, bytes = jpeg.len(), "POST");
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .with_context(|| format!("cannot reach {url}"))?;
        Ok(serde_json::from_slice(&read_body(resp).await?)?)
    }
}

async fn read_body(resp: reqwest::Response) -> Result<Vec<u8>> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        bail!("{status}: {}", String::from_utf8_lossy(&body).trim());
    }
    Ok(body.to_vec())
}

/// Replace the entry called `name` or append a new one. Returns whether an
/// existing entry was replaced.
fn upsert_person(roster: &mut Vec<Person>, name: &str, embedding: Vec<f32>) -> bool {
    if let Some(existing) = roster.iter_mut().find(|p| p.name == name) {
        existing.embedding = embedding;
        return true;
    }
    roster.push(Person {
        name: name.to_string(),
        embedding,
    });
    false
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let gateway = Gateway::new(&cli.addr);

    match cli.command {
        Commands::Faces => {
            let faces: Vec<FaceRecord> = serde_json::from_slice(&gateway.get("/").await?)?;
            if faces.is_empty() {
                println!("No faces cached");
            }
            for (index, face) in faces.iter().enumerate() {
                println!(
                    "{index:>4}  {}  {}x{}  {} dims",
                    face.captured_at.to_rfc3339(),
                    face.width,
                    face.height,
                    face.embedding.len()
                );
            }
        }
        Commands::Face { index, image } => {
            let face: FaceRecord =
                serde_json::from_slice(&gateway.get(&index.to_string()).await?)?;
            println!("index:     {index}");
            println!("time:      {}", face.captured_at.to_rfc3339());
            println!("size:      {}x{}", face.width, face.height);
            println!("mime type: {}", face.mime_type);
            println!("embedding: {}", serde_json::to_string(&face.embedding)?);
            if let Some(path) = image {
                write_file(&path, &face.image)?;
            }
        }
        Commands::Frame { output } => {
            let frame = gateway.get("/frame").await?;
            write_file(&output, &frame)?;
        }
        Commands::Peaks => {
            let peaks: Vec<Peak> = serde_json::from_slice(&gateway.get("/peaks").await?)?;
            if peaks.is_empty() {
                println!("No cluster peaks");
            }
            for peak in &peaks {
                println!("weight {:.3}  {} dims", peak.weight, peak.centroid.len());
            }
        }
        Commands::Enroll {
            photo,
            name,
            people: roster_path,
        } => {
            let decoded = image::open(&photo)
                .with_context(|| format!("failed to read {}", photo.display()))?
                .to_rgb8();
            let body = jpeg::encode(&decoded, 95)?;
            let embedding = gateway.post_face(body).await?;
            println!("Classified {} ({} dims)", photo.display(), embedding.len());

            let mut roster = people::load_people(&roster_path)?;
            let replaced = upsert_person(&mut roster, &name, embedding);
            people::save_people(&roster_path, &roster)?;
            println!(
                "{} {name} in {} ({} people)",
                if replaced { "Updated" } else { "Enrolled" },
                roster_path.display(),
                roster.len()
            );
        }
    }

    Ok(())
}
