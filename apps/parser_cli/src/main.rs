use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    export::{export_result, label_from_email, ExportError},
    settings::load_settings,
    AuthSession, BillingService, ClientError, ControllerEvent, ProfileService, ServiceClient,
    SignInState, UploadController, UploadFile,
};
use futures::StreamExt;
use serde_json::Value;
use shared::protocol::{Profile, FREE_PLAN_USAGE_LIMIT};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "statement-parser", about = "Extract bank statement PDFs into JSON")]
struct Cli {
    /// Overrides `api_url` from client.toml / APP__API_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Bearer token issued by the identity provider (or APP__ID_TOKEN).
    #[arg(long)]
    token: Option<String>,
    #[arg(long, default_value = "anonymous")]
    email: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a statement and wait for the extracted JSON.
    Upload {
        file: PathBuf,
        #[arg(long)]
        export_dir: Option<PathBuf>,
        #[arg(long)]
        no_export: bool,
    },
    /// Show plan and usage.
    Profile,
    /// Print the checkout link for the paid plan.
    Upgrade,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings().context("failed to load client settings")?;
    if let Some(api_url) = cli.api_url {
        settings.api_url = api_url;
        settings = settings.validated().context("invalid --api-url")?;
    }
    if let Some(token) = cli.token {
        settings.id_token = Some(token);
    }

    let auth = Arc::new(AuthSession::new());
    let mut sign_in_states = auth.subscribe();
    tokio::spawn(async move {
        while let Some(state) = sign_in_states.next().await {
            match state {
                SignInState::SignedIn { email } => info!(email = %email, "session active"),
                SignInState::SignedOut => warn!("no identity token configured"),
                SignInState::Loading => {}
            }
        }
    });
    match settings.id_token.clone() {
        Some(token) => auth.sign_in(cli.email, token).await,
        None => auth.sign_out().await,
    }

    let client = Arc::new(
        ServiceClient::from_settings(&settings, auth.clone())
            .context("failed to build service client")?,
    );
    info!(api_url = %client.api_url(), "using processing service");

    match cli.command {
        Command::Profile => {
            let profile = client.profile().await.map_err(signed_in_hint)?;
            print_profile(&profile);
        }
        Command::Upgrade => {
            let session = client
                .create_checkout_session()
                .await
                .map_err(signed_in_hint)?;
            let target = session
                .redirect_target()
                .ok_or_else(|| anyhow!("checkout session carried no redirect target"))?;
            println!("Continue to checkout: {target}");
        }
        Command::Upload {
            file,
            export_dir,
            no_export,
        } => {
            let export_dir =
                (!no_export).then(|| export_dir.unwrap_or_else(|| settings.export_dir.clone()));
            run_upload(client, file, export_dir, settings.poll_interval()).await?;
        }
    }

    Ok(())
}

fn signed_in_hint(err: ClientError) -> anyhow::Error {
    if err.is_unauthenticated() {
        anyhow!("not signed in: pass --token or set APP__ID_TOKEN")
    } else {
        anyhow::Error::new(err)
    }
}

fn print_profile(profile: &Profile) {
    println!("{}", profile.email);
    println!("Plan: {} | Used: {}", profile.plan, profile.usage_count);
    if profile.offers_upgrade() {
        println!(
            "Free plan: {} of {FREE_PLAN_USAGE_LIMIT} submissions used. Run `upgrade` for unlimited processing.",
            profile.usage_count
        );
    }
}

async fn run_upload(
    client: Arc<ServiceClient>,
    path: PathBuf,
    export_dir: Option<PathBuf>,
    poll_interval: std::time::Duration,
) -> Result<()> {
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "statement.pdf".to_string());

    let controller =
        UploadController::with_poll_interval(client.clone(), client.clone(), poll_interval)
            .context("invalid poll interval")?;

    let profile = controller.refresh_profile().await.map_err(signed_in_hint)?;
    if profile.quota_exhausted() {
        bail!(
            "free plan limit of {FREE_PLAN_USAGE_LIMIT} submissions reached; run `upgrade` to continue"
        );
    }

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControllerEvent::PhaseChanged(snapshot) => println!("{}", snapshot.status_text),
                ControllerEvent::ProfileUpdated(profile) => {
                    println!("Used: {} ({})", profile.usage_count, profile.plan)
                }
            }
        }
    });

    controller.select_file(UploadFile::pdf(filename, bytes));
    controller
        .submit_selected()
        .await
        .map_err(signed_in_hint)
        .context("upload failed")?;

    let outcome = tokio::select! {
        outcome = controller.wait_for_completion() => outcome,
        _ = tokio::signal::ctrl_c() => {
            controller.shutdown();
            bail!("cancelled; the server-side task was left running");
        }
    };

    let label = label_from_email(controller.snapshot().profile.as_ref().map(|p| p.email.as_str()));
    drop(controller);
    let _ = printer.await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(dir) = export_dir {
                if let Some(path) = export_if_present(&result, &label, &dir)? {
                    println!("Saved {}", path.display());
                }
            }
            Ok(())
        }
        Err(ClientError::ProcessingFailed(payload)) => {
            eprintln!("{}", serde_json::to_string_pretty(&payload)?);
            bail!("document processing failed")
        }
        Err(err) => Err(err.into()),
    }
}

/// Exports `result`, skipping (with a warning) a task that finished without one.
fn export_if_present(result: &Value, label: &str, dir: &Path) -> Result<Option<PathBuf>> {
    match export_result(result, label, dir) {
        Ok(path) => Ok(Some(path)),
        Err(ExportError::EmptyResult) => {
            warn!("task finished without a result; nothing exported");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use serde_json::json;

    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        env::temp_dir().join(format!("{prefix}_{suffix}"))
    }

    #[test]
    fn empty_result_skips_export() {
        let dir = temp_dir("statement_cli_empty_export");
        assert_eq!(
            export_if_present(&Value::Null, "ann", &dir).expect("skipped"),
            None
        );
        assert!(!dir.exists());
    }

    #[test]
    fn present_result_is_exported() {
        let dir = temp_dir("statement_cli_export");
        let path = export_if_present(&json!({"total": 42}), "ann", &dir)
            .expect("export")
            .expect("written");
        assert!(path.starts_with(&dir));
        assert!(path.exists());

        fs::remove_dir_all(dir).expect("cleanup");
    }
}
