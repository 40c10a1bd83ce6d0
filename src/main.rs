use clap::{ArgAction, Parser, Subcommand};
use lambda_runtime::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_lambda_harness::config::HarnessConfig;
use async_lambda_harness::error::ErrorClassifier;
use async_lambda_harness::inject::with_config;
use async_lambda_harness::lifecycle::{
    serve, CleanupRegistry, Invocation, InvocationAdapter, SignalBridge,
};
use async_lambda_harness::logging::{init_logging, LogLevel};
use async_lambda_harness::retry::PolicyError;
use async_lambda_harness::router::Router;

type Error = lambda_runtime::Error;
type Functions = Router<Value, Context, Value, Error>;

#[derive(Parser, Debug)]
#[command(name = "bootstrap")]
#[command(version)]
#[command(about = "Lambda bootstrap for async handlers")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Lambda runtime API loop
    Serve {
        /// Function to run (defaults to LAMBDA_FUNCTION_ID)
        #[arg(long, short)]
        function: Option<String>,
    },

    /// Run one invocation locally and print the response as JSON
    Invoke {
        /// Function to invoke
        #[arg(long, short)]
        function: String,

        /// JSON file with the event payload (defaults to `{}`)
        #[arg(long, short)]
        event: Option<PathBuf>,
    },

    /// List the functions this binary can route to
    Functions,
}

#[derive(Debug, Deserialize)]
struct HealthSettings {
    #[serde(default = "default_stage")]
    stage: String,
}

fn default_stage() -> String {
    "dev".to_string()
}

async fn echo(invocation: Invocation, _: ()) -> Result<Value, Error> {
    Ok(json!({ "statusCode": 200, "body": invocation.event() }))
}

async fn health(
    _: Invocation,
    (settings, ()): (Arc<HealthSettings>, ()),
) -> Result<Value, Error> {
    Ok(json!({
        "statusCode": 200,
        "body": { "status": "ok", "stage": settings.stage },
    }))
}

/// Shared lifecycle state for every routed function.
struct Harness {
    registry: Arc<CleanupRegistry>,
    bridge: Option<Arc<SignalBridge>>,
    classifier: Arc<ErrorClassifier>,
}

impl Harness {
    fn new(config: &HarnessConfig) -> Result<Self, PolicyError> {
        let registry = config.cleanup_registry();
        let bridge = config.install_signal_handlers.then(|| {
            Arc::new(SignalBridge::new(Arc::clone(&registry)).with_exit_code(config.signal_exit_code))
        });
        Ok(Self {
            registry,
            bridge,
            classifier: Arc::new(ErrorClassifier::new(config.retry_policy()?)),
        })
    }

    fn adapt<H>(&self, handler: H) -> InvocationAdapter<H> {
        let adapter = InvocationAdapter::new(handler, Arc::clone(&self.registry))
            .with_classifier(Arc::clone(&self.classifier));
        match &self.bridge {
            Some(bridge) => adapter.with_signal_bridge(Arc::clone(bridge)),
            None => adapter,
        }
    }

    fn functions(&self) -> Functions {
        Router::new()
            .route("echo", self.adapt(echo))
            .route("health", self.adapt(with_config(health)))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match HarnessConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut logging = config.logging_config();
    if cli.verbose > 0 {
        logging = logging.with_level(LogLevel::from(cli.verbose));
    }
    if !matches!(cli.command, Commands::Serve { .. }) {
        logging = logging.local();
    }
    init_logging(logging);

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, config: &HarnessConfig) -> Result<(), Error> {
    let harness = Harness::new(config)?;

    match command {
        Commands::Functions => {
            let functions = harness.functions();
            for id in functions.function_ids() {
                println!("{id}");
            }
        }
        Commands::Invoke { function, event } => {
            let event = match event {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => json!({}),
            };
            let mut context = Context::default();
            context.request_id = "local".to_string();

            let response = harness.functions().dispatch(&function, event, context)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Serve { function } => {
            let mut functions = harness.functions();
            if let Some(id) = function {
                functions = functions.with_function(id);
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve(functions))?;
        }
    }
    Ok(())
}
