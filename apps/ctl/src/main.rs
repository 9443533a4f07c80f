use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use heat_protocol::sync::AutomationMode;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "heat-ctl", about = "One-shot commands against the heat server")]
struct Cli {
    /// Server base URL.
    #[arg(long, env = "HEAT_SERVER_URL", default_value = "http://localhost:8000")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    Power,
    Oscillation,
    Display,
    Plug,
}

impl Switch {
    fn path(self) -> &'static str {
        match self {
            Switch::Power => "/api/power/toggle",
            Switch::Oscillation => "/api/oscillation/toggle",
            Switch::Display => "/api/display/toggle",
            Switch::Plug => "/api/plug/toggle",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Manual,
    Tou,
}

impl From<Mode> for AutomationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Manual => AutomationMode::Manual,
            Mode::Tou => AutomationMode::Tou,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Latest telemetry, targets and tariff.
    Status,
    /// Set the target temperature in °F.
    Target { temp: i64 },
    /// Flip one of the on/off intents.
    Toggle {
        #[arg(value_enum)]
        switch: Switch,
    },
    /// Battery AC charge power in watts.
    Charge { watts: i64 },
    /// Show or change automation settings.
    Settings {
        #[arg(long)]
        control: Option<bool>,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },
    /// Start sleep mode until the given wall-clock time.
    Sleep {
        /// e.g. "7:00 AM"
        wake: String,
        /// Comma separated progress:temp points, e.g. "0:70,0.5:65,1:68".
        #[arg(long, default_value = "0:70,0.5:65,1:68")]
        curve: String,
    },
    /// Show the active sleep schedule.
    SleepStatus,
    /// Cancel sleep mode.
    Wake,
    /// Savings over the last N hours.
    Savings {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

fn parse_curve(text: &str) -> Result<Value> {
    let mut points = Vec::new();
    for point in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((progress, temp)) = point.split_once(':') else {
            bail!("Bad curve point {:?}, expected progress:temp", point);
        };
        let progress: f64 = progress
            .trim()
            .parse()
            .with_context(|| format!("Bad progress in {:?}", point))?;
        let temp: f64 = temp
            .trim()
            .parse()
            .with_context(|| format!("Bad temperature in {:?}", point))?;
        points.push(json!({ "progress": progress, "temp": temp }));
    }
    Ok(Value::Array(points))
}

struct Api {
    http: reqwest::Client,
    base: String,
}

impl Api {
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.context("Request failed")?;
        let status = response.status();
        let body: Value = response.json().await.context("Malformed response")?;
        if !status.is_success() {
            let error = body["error"].as_str().unwrap_or("unknown error");
            bail!("Server answered {}: {}", status, error);
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.http.get(format!("{}{}", self.base, path))).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(self.http.post(format!("{}{}", self.base, path)).json(&body))
            .await
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = Api {
        http: reqwest::Client::new(),
        base: cli.server.trim_end_matches('/').to_string(),
    };

    let result = match cli.command {
        Command::Status => api.get("/api/status").await?,
        Command::Target { temp } => api.post("/api/target", json!({ "temp": temp })).await?,
        Command::Toggle { switch } => api.post(switch.path(), Value::Null).await?,
        Command::Charge { watts } => {
            api.post("/api/battery/charge", json!({ "watts": watts })).await?
        }
        Command::Settings { control, mode } => {
            if control.is_none() && mode.is_none() {
                api.get("/api/settings").await?
            } else {
                let mode = mode.map(AutomationMode::from);
                api.post(
                    "/api/settings",
                    json!({ "driver_control_enabled": control, "automation_mode": mode }),
                )
                .await?
            }
        }
        Command::Sleep { wake, curve } => {
            let curve = parse_curve(&curve)?;
            api.post("/api/sleep", json!({ "wake_time": wake, "curve": curve }))
                .await?
        }
        Command::SleepStatus => api.get("/api/sleep").await?,
        Command::Wake => api.post("/api/sleep/cancel", Value::Null).await?,
        Command::Savings { hours } => api.get(&format!("/api/savings?hours={}", hours)).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
