use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "attend", about = "Face recognition attendance CLI")]
struct Cli {
    /// Base URL of the attendd API
    #[arg(long, env = "ATTEND_URL", default_value = "http://localhost:5000/api")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a user from a photo
    Register {
        user_id: String,
        image: PathBuf,
        /// Display name (defaults to the user id)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Recognize a face and record attendance
    Recognize {
        image: PathBuf,
        /// Use the trained deep model instead of LBP features
        #[arg(long)]
        deep: bool,
    },
    /// List attendance records, newest first
    Attendance,
    /// List registered users
    Users,
    /// Train the deep model
    Train {
        /// Retrain even if a model already exists
        #[arg(short, long)]
        force: bool,
    },
    /// Show daemon status
    Status,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.base))?;
        read_body(response).await
    }

    async fn post_form(&self, path: &str, form: Form) -> Result<Value> {
        let response = self
            .http
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.base))?;
        read_body(response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.base))?;
        read_body(response).await
    }
}

/// Decode the JSON body; a non-2xx status becomes an error carrying the server's message.
async fn read_body(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("unexpected response from server (HTTP {status})"))?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        bail!("{message} (HTTP {})", status.as_u16());
    }
    Ok(body)
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    let mime = match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        _ => "image/jpeg",
    };
    Ok(Part::bytes(bytes).file_name(file_name).mime_str(mime)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);
    tracing::debug!(server = %client.base, "using server");

    match cli.command {
        Commands::Register { user_id, image, name } => {
            let mut form = Form::new().text("userId", user_id);
            if let Some(name) = name {
                form = form.text("name", name);
            }
            let form = form.part("file", image_part(&image).await?);
            let body = client.post_form("register", form).await?;
            println!("{}", body["message"].as_str().unwrap_or("registered"));
        }
        Commands::Recognize { image, deep } => {
            let form = Form::new()
                .text("useDeepLearning", deep.to_string())
                .part("file", image_part(&image).await?);
            let body = client.post_form("recognize", form).await?;
            if body["recognized"].as_bool().unwrap_or(false) {
                println!(
                    "Recognized {} ({}) with confidence {:.3}",
                    body["user"]["name"].as_str().unwrap_or("?"),
                    body["user"]["userId"].as_str().unwrap_or("?"),
                    body["confidence"].as_f64().unwrap_or(0.0),
                );
                println!("Attendance recorded at {}", body["attendanceRecorded"].as_str().unwrap_or("?"));
            } else {
                println!("Face not recognized");
            }
        }
        Commands::Attendance => {
            let body = client.get("attendance").await?;
            let records = body["records"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                println!("No attendance records");
            }
            for record in records {
                println!(
                    "{}  {:<16} {:<24} {:.3}",
                    record["timestamp"].as_str().unwrap_or("?"),
                    record["userId"].as_str().unwrap_or("?"),
                    record["name"].as_str().unwrap_or("?"),
                    record["confidence"].as_f64().unwrap_or(0.0),
                );
            }
        }
        Commands::Users => {
            let body = client.get("users").await?;
            let users = body["users"].as_array().cloned().unwrap_or_default();
            if users.is_empty() {
                println!("No users registered");
            }
            for user in users {
                println!(
                    "{:<16} {}",
                    user["userId"].as_str().unwrap_or("?"),
                    user["name"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::Train { force } => {
            println!("Training model (this may take a while)...");
            let body = client
                .post_json("train-model", &serde_json::json!({ "forceRetrain": force }))
                .await?;
            println!("{}", body["message"].as_str().unwrap_or("done"));
            if let Some(version) = body["modelVersion"].as_str() {
                println!("Model version: {version}");
            }
        }
        Commands::Status => {
            let body = client.get("status").await?;
            println!("attendd {}", body["version"].as_str().unwrap_or("?"));
            println!("  detector:      {}", body["detector"].as_str().unwrap_or("?"));
            match body["modelVersion"].as_str() {
                Some(version) => println!("  deep model:    {version}"),
                None => println!("  deep model:    not trained"),
            }
            println!("  users:         {}", body["users"]);
            println!("  records:       {}", body["records"]);
        }
    }

    Ok(())
}
