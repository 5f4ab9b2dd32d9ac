//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;

use fleet_fusion::core::config::Config;
use fleet_fusion::core::errors::FleetError;
use fleet_fusion::core::ids::{DriverId, VehicleId};
use fleet_fusion::fusion::assignment::Assignment;
use fleet_fusion::service::fleet::Fleet;
use fleet_fusion::service::upload::UploadRequest;
use fleet_fusion::store::{ActivityQuery, ActivityStore};
use fleet_fusion::tacho::activity::{ActivityState, DriverSlot};
use fleet_fusion::telemetry::ingestor::{Ping, PositionReport, RawPositionReport, parse_timestamp};
use fleet_fusion::telemetry::presence::Coordinates;

/// Fleet Fusion: tachograph activity and GPS telemetry on one timeline.
#[derive(Debug, Parser)]
#[command(
    name = "ffx",
    author,
    version,
    about = "Fleet Fusion - tachograph and telemetry reconciliation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Upload a tachograph file (.ddd driver card or .tgd vehicle unit).
    Upload(UploadArgs),
    /// Ingest position reports from a JSON-lines file.
    Ingest(IngestArgs),
    /// Record a liveness ping for a vehicle.
    Ping(PingArgs),
    /// Show the online status of one vehicle or of every known vehicle.
    Status(StatusArgs),
    /// Count online and offline vehicles.
    Fleet,
    /// Fuse a driver's activities with GPS positions.
    Fuse(FuseArgs),
    /// List a driver's stored activities, newest first.
    Activities(ActivitiesArgs),
    /// Register a driver id.
    RegisterDriver(IdArgs),
    /// Register a vehicle id.
    RegisterVehicle(IdArgs),
    /// Record a driver-to-vehicle assignment.
    Assign(AssignArgs),
    /// Delete positions older than the configured retention.
    Prune,
    /// Show configuration state.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct UploadArgs {
    /// File to upload; its extension selects the format.
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Driver the file belongs to.
    #[arg(long, value_name = "ID")]
    driver: String,
    /// Vehicle unit slot to extract (`primary` or `co_driver`).
    #[arg(long, value_name = "SLOT")]
    slot: Option<DriverSlot>,
}

#[derive(Debug, Clone, Args)]
struct IngestArgs {
    /// JSON-lines file, one report per line. `-` reads stdin.
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct PingArgs {
    #[arg(value_name = "VEHICLE")]
    vehicle: String,
    /// Ping time (RFC 3339 or unix seconds). Defaults to now.
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    at: Option<DateTime<Utc>>,
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,
}

#[derive(Debug, Clone, Args)]
struct StatusArgs {
    /// Vehicle to show; omit for all known vehicles.
    #[arg(value_name = "VEHICLE")]
    vehicle: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct FuseArgs {
    #[arg(long, value_name = "ID")]
    driver: String,
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    start: DateTime<Utc>,
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    end: DateTime<Utc>,
}

#[derive(Debug, Clone, Args)]
struct ActivitiesArgs {
    #[arg(long, value_name = "ID")]
    driver: String,
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    start: Option<DateTime<Utc>>,
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    end: Option<DateTime<Utc>>,
    /// Only this state (DRIVING, WORK, REST, BREAK, AVAILABILITY).
    #[arg(long, value_name = "STATE")]
    state: Option<ActivityState>,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    /// Print minute totals instead of rows; requires --start and --end.
    #[arg(long, requires_all = ["start", "end"])]
    summary: bool,
}

#[derive(Debug, Clone, Args)]
struct IdArgs {
    #[arg(value_name = "ID")]
    id: String,
}

#[derive(Debug, Clone, Args)]
struct AssignArgs {
    #[arg(long, value_name = "ID")]
    driver: String,
    #[arg(long, value_name = "ID")]
    vehicle: String,
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    from: DateTime<Utc>,
    /// End of the assignment; omit for open-ended.
    #[arg(long, value_name = "TIME", value_parser = parse_time)]
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Json(_) | Self::Io(_) => 2,
        }
    }
}

impl From<FleetError> for CliError {
    fn from(value: FleetError) -> Self {
        match value {
            FleetError::InvalidConfig { .. }
            | FleetError::MissingConfig { .. }
            | FleetError::ConfigParse { .. }
            | FleetError::InvalidInput { .. }
            | FleetError::NotFound { .. } => Self::User(value.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).map_err(|e| e.to_string())
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if let Command::Config(args) = &cli.command {
        return run_config(cli, args);
    }

    let config = Config::load(cli.config.as_deref())?;
    let fleet = Fleet::open(config)?;
    let result = dispatch(&fleet, &cli.command);
    if let Err(CliError::Runtime(message)) = &result {
        fleet.report_error("FFX-3900", message);
    }
    result
}

fn dispatch(fleet: &Fleet, command: &Command) -> Result<(), CliError> {
    match command {
        Command::Upload(args) => run_upload(fleet, args),
        Command::Ingest(args) => run_ingest(fleet, args),
        Command::Ping(args) => run_ping(fleet, args),
        Command::Status(args) => run_status(fleet, args),
        Command::Fleet => {
            let counts = fleet.telemetry.fleet_counts()?;
            write_json_line(&json!({ "command": "fleet", "counts": counts }))
        }
        Command::Fuse(args) => {
            let report = fleet
                .fusion
                .fuse(&DriverId::new(args.driver.as_str()), args.start, args.end)?;
            write_json_line(&json!({ "command": "fuse", "report": report }))
        }
        Command::Activities(args) => run_activities(fleet, args),
        Command::RegisterDriver(args) => {
            fleet.store.register_driver(&DriverId::new(args.id.as_str()))?;
            write_json_line(&json!({ "command": "register-driver", "driver_id": args.id }))
        }
        Command::RegisterVehicle(args) => {
            fleet.store.register_vehicle(&VehicleId::new(args.id.as_str()))?;
            write_json_line(&json!({ "command": "register-vehicle", "vehicle_id": args.id }))
        }
        Command::Assign(args) => {
            let assignment = Assignment {
                driver_id: DriverId::new(args.driver.as_str()),
                vehicle_id: VehicleId::new(args.vehicle.as_str()),
                assigned_from: args.from,
                assigned_until: args.until,
            };
            fleet.store.record_assignment(&assignment)?;
            write_json_line(&json!({ "command": "assign", "assignment": assignment }))
        }
        Command::Prune => {
            let removed = fleet.prune()?;
            write_json_line(&json!({
                "command": "prune",
                "removed": removed,
                "retention_days": fleet.config().storage.position_retention_days,
            }))
        }
        Command::Config(_) => Err(CliError::Runtime("config handled before dispatch".to_string())),
    }
}

fn run_upload(fleet: &Fleet, args: &UploadArgs) -> Result<(), CliError> {
    let bytes = fs::read(&args.file).map_err(|e| {
        CliError::User(format!("cannot read {}: {e}", args.file.display()))
    })?;
    let file_name = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let response = fleet.uploads.upload(&UploadRequest {
        file_name,
        bytes,
        driver_id: DriverId::new(args.driver.as_str()),
        slot: args.slot,
    });
    write_json_line(&json!({ "command": "upload", "response": response }))?;
    if response.success {
        Ok(())
    } else {
        Err(CliError::User(response.errors.join("; ")))
    }
}

fn run_ingest(fleet: &Fleet, args: &IngestArgs) -> Result<(), CliError> {
    let reader: Box<dyn BufRead> = if args.file.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file = fs::File::open(&args.file).map_err(|e| {
            CliError::User(format!("cannot open {}: {e}", args.file.display()))
        })?;
        Box::new(BufReader::new(file))
    };

    let mut errors: Vec<Value> = Vec::new();
    let mut reports: Vec<(usize, PositionReport)> = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<RawPositionReport>(&line)
            .map_err(|e| ("FFX-2101".to_string(), e.to_string()))
            .and_then(|raw| raw.parse().map_err(|e| (e.code().to_string(), e.to_string())));
        match parsed {
            Ok(report) => reports.push((line_no, report)),
            Err((code, message)) => {
                errors.push(json!({ "line": line_no, "code": code, "message": message }));
            }
        }
    }

    let mut accepted = 0usize;
    let chunk_size = fleet.config().telemetry.max_batch.max(1);
    for chunk in reports.chunks(chunk_size) {
        let batch: Vec<PositionReport> = chunk.iter().map(|(_, r)| r.clone()).collect();
        let results = fleet.telemetry.ingest_batch(&batch);
        for ((line_no, _), result) in chunk.iter().zip(results) {
            match result {
                Ok(_) => accepted += 1,
                Err(e) => errors.push(json!({
                    "line": line_no,
                    "code": e.code(),
                    "message": e.to_string(),
                })),
            }
        }
    }

    write_json_line(&json!({
        "command": "ingest",
        "accepted": accepted,
        "rejected": errors.len(),
        "errors": errors,
    }))
}

fn run_ping(fleet: &Fleet, args: &PingArgs) -> Result<(), CliError> {
    let ping = Ping {
        vehicle_id: VehicleId::new(args.vehicle.as_str()),
        timestamp: args.at.unwrap_or_else(Utc::now),
        position: args
            .lat
            .zip(args.lon)
            .map(|(latitude, longitude)| Coordinates {
                latitude,
                longitude,
            }),
    };
    let outcome = fleet.telemetry.ping(&ping).map_err(|e| CliError::User(e.to_string()))?;
    write_json_line(&json!({ "command": "ping", "ping": ping, "outcome": outcome }))
}

fn run_status(fleet: &Fleet, args: &StatusArgs) -> Result<(), CliError> {
    match &args.vehicle {
        Some(vehicle) => {
            let status = fleet.telemetry.vehicle_status(&VehicleId::new(vehicle.as_str()))?;
            write_json_line(&json!({ "command": "status", "status": status }))
        }
        None => {
            let statuses = fleet.telemetry.all_statuses()?;
            write_json_line(&json!({ "command": "status", "vehicles": statuses }))
        }
    }
}

fn run_activities(fleet: &Fleet, args: &ActivitiesArgs) -> Result<(), CliError> {
    let driver = DriverId::new(args.driver.as_str());
    if args.summary {
        let (Some(start), Some(end)) = (args.start, args.end) else {
            return Err(CliError::User("--summary needs --start and --end".to_string()));
        };
        let summary = fleet.fusion.activity_summary(&driver, start, end)?;
        return write_json_line(&json!({ "command": "activities", "summary": summary }));
    }

    let query = ActivityQuery {
        start: args.start,
        end: args.end,
        state: args.state,
        limit: args.limit,
    };
    let rows = fleet.store.list_intervals(&driver, &query)?;
    write_json_line(&json!({ "command": "activities", "count": rows.len(), "activities": rows }))
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            write_json_line(&json!({
                "command": "config path",
                "path": path.to_string_lossy(),
                "exists": path.exists(),
            }))
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;
            write_json_line(&json!({ "command": "config show", "config": config }))
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => write_json_line(&json!({
                "command": "config validate",
                "valid": true,
                "path": config.paths.config_file.to_string_lossy(),
                "hash": config.stable_hash()?,
            })),
            Err(e) => {
                write_json_line(&json!({
                    "command": "config validate",
                    "valid": false,
                    "error": e.to_string(),
                }))?;
                Err(CliError::User(e.to_string()))
            }
        },
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}
