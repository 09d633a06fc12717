use clap::{Parser, Subcommand};
use kube::Client;
use log::{error, info};
use mo_operator::config::OperatorConfig;
use mo_operator::errors::*;
use mo_operator::manager::Manager;
use mo_operator::{crd, webhook, OPERATOR_VERSION};

#[derive(Parser, Debug)]
#[command(name = "mo-operator", version, about = "Kubernetes operator for MatrixOne clusters")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: OperatorConfig,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every CustomResourceDefinition as multi-document YAML.
    Crd,
    /// Run the controllers and the admission webhook (default).
    Run,
}

fn print_crds() -> Result<()> {
    for crd in crd::all() {
        let doc = serde_yaml::to_string(&crd).chain_err(|| "cannot render CRD")?;
        print!("---\n{}", doc);
    }
    Ok(())
}

async fn run(config: OperatorConfig) -> Result<()> {
    info!("mo-operator {} starting", OPERATOR_VERSION);
    // in-cluster configuration first, then the local kubeconfig
    let client = Client::try_default().await?;
    let serve_webhook = !config.disable_webhook;
    let (manager, controllers) = Manager::new(client, config).await?;

    if serve_webhook {
        let config = manager.config.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(&config).await {
                error!("webhook server exited: {}", e);
            }
        });
    } else {
        info!("admission webhook disabled");
    }

    controllers.await;
    info!("mo-operator stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let res = match cli.command.unwrap_or(Command::Run) {
        Command::Crd => print_crds(),
        Command::Run => run(cli.config).await,
    };
    if let Err(e) = res {
        error!("{}", e);
        for cause in e.iter().skip(1) {
            error!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
