//! DLG Connect entitlement client
//!
//! Composition root for the entitlement engine: builds one reconciler from
//! the environment and runs a single operation.
//!
//! Usage:
//!   dlg-connect login --email a@b.com --password secret
//!   dlg-connect verify
//!
//! Outcomes are printed as JSON on stdout, logs go to stderr. Exit code 0
//! means access or success, 1 a denial, 2 a server that could not be reached.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dlg_entitlement::{
    AccessDecision, AccessMode, ActivityEvent, BanState, ClientConfig, DeviceInfo,
    EntitlementError, EntitlementResult, HttpGateway, LicenseState, Reconciler,
    TrialState, UserAccount,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const EXIT_DENIED: u8 = 1;
const EXIT_TRANSPORT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "dlg-connect")]
#[command(about = "DLG Connect entitlement client")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the saved session
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Entitlement endpoint URL
    #[arg(long, global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and remember the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Human-verification token, when the server requires one
        #[arg(long)]
        captcha: Option<String>,
    },
    /// Resume the saved session
    Verify,
    /// Resume the saved session and print everything known about the user
    Status,
    /// Log out and forget the saved session
    Logout,
    /// Refresh the license of the saved user
    CheckLicense,
    /// Show the trial state of this device
    CheckTrial,
    /// Start the trial of this device
    RegisterTrial,
    /// Show the human-verification settings of the login form
    CaptchaSettings,
    /// Show the device identity sent to the server
    Device,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    decision: &'a AccessDecision,
    access_type: AccessMode,
    plan_name: Option<&'a str>,
    user: Option<&'a UserAccount>,
    license: Option<&'a LicenseState>,
    trial: Option<&'a TrialState>,
    ban: Option<&'a BanState>,
}

#[derive(Serialize)]
struct DeviceReport<'a> {
    fingerprint: &'a str,
    stable: bool,
    info: &'a DeviceInfo,
}

#[derive(Serialize)]
struct ErrorReport {
    error: String,
    code: Option<String>,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = ClientConfig::from_env().context("reading configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(url) = args.api_url {
        config.api_url = url;
    }
    debug!(session = %config.session_path().display(), "configuration loaded");

    let gateway = HttpGateway::new(&config).context("building HTTP client")?;
    let mut reconciler = Reconciler::from_config(gateway, &config);
    reconciler.add_observer(|event: ActivityEvent| debug!(?event, "activity"));

    run(&mut reconciler, args.command)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(reconciler: &mut Reconciler<HttpGateway>, command: Command) -> Result<ExitCode> {
    match command {
        Command::Login {
            email,
            password,
            captcha,
        } => {
            let decision = reconciler.login(&email, &password, captcha.as_deref());
            decide(&decision)
        }
        Command::Verify => {
            let decision = reconciler.verify_session();
            decide(&decision)
        }
        Command::Status => {
            let decision = reconciler.verify_session();
            print_json(&StatusReport {
                decision: &decision,
                access_type: reconciler.access_type(),
                plan_name: reconciler.plan_name(),
                user: reconciler.user(),
                license: reconciler.license(),
                trial: reconciler.trial(),
                ban: reconciler.ban(),
            })?;
            Ok(exit_code(&decision))
        }
        Command::Logout => {
            let outcome = reconciler.logout();
            info!(?outcome, "logout finished");
            print_json(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckLicense => match resume(reconciler)? {
            Some(exit) => Ok(exit),
            None => report(reconciler.check_license()),
        },
        Command::CheckTrial => report(reconciler.check_trial()),
        Command::RegisterTrial => match resume(reconciler)? {
            Some(exit) => Ok(exit),
            None => report(reconciler.register_trial()),
        },
        Command::CaptchaSettings => report(reconciler.captcha_settings()),
        Command::Device => {
            let fingerprint = reconciler.fingerprint();
            print_json(&DeviceReport {
                fingerprint: fingerprint.id(),
                stable: fingerprint.is_stable(),
                info: reconciler.device(),
            })?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Resumes the saved session for commands that need a user.
///
/// Returns the exit code to stop with when no user could be resumed; the
/// decision explaining why has been printed.
fn resume(reconciler: &mut Reconciler<HttpGateway>) -> Result<Option<ExitCode>> {
    let decision = reconciler.verify_session();
    if reconciler.is_authenticated() {
        return Ok(None);
    }
    print_json(&decision)?;
    Ok(Some(exit_code(&decision)))
}

fn decide(decision: &AccessDecision) -> Result<ExitCode> {
    print_json(decision)?;
    Ok(exit_code(decision))
}

fn exit_code(decision: &AccessDecision) -> ExitCode {
    match decision {
        AccessDecision::Granted { .. } => ExitCode::SUCCESS,
        AccessDecision::TransportFailed { .. } => ExitCode::from(EXIT_TRANSPORT),
        AccessDecision::Denied { .. } | AccessDecision::NoSession => ExitCode::from(EXIT_DENIED),
    }
}

fn report<T: Serialize>(result: EntitlementResult<T>) -> Result<ExitCode> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let (code, exit) = match &e {
                EntitlementError::Rejected { code, .. } => (code.clone(), EXIT_DENIED),
                EntitlementError::Transport(_) => (Some("transport".to_string()), EXIT_TRANSPORT),
                EntitlementError::NotAuthenticated => {
                    (Some("not_authenticated".to_string()), EXIT_DENIED)
                }
                _ => (None, EXIT_DENIED),
            };
            print_json(&ErrorReport {
                error: e.to_string(),
                code,
            })?;
            Ok(ExitCode::from(exit))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{out}");
    Ok(())
}
