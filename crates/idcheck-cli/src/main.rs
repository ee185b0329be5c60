use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use idcheck_core::app::{
    LoadDriver, PersistenceStage, RequestGenerator, RequestSender, RpcClient, ValidationBootstrap,
    ValidationWorker,
};
use idcheck_core::config::AppConfig;
use idcheck_core::domain::{
    ErrorKind, RegistrationRequest, ValidationResponse, is_well_formed_dni,
};
use idcheck_core::impls::InMemoryBackend;
use idcheck_core::ports::{SystemClock, UlidGenerator};

#[derive(Parser, Debug)]
#[command(name = "idcheck")]
#[command(version)]
#[command(about = "Identity validation saga over a message bus.", long_about = None)]
struct Cli {
    /// TOML config file. Missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one registration request and print the outcome.
    Register {
        #[arg(long)]
        dni: String,
        #[arg(long)]
        nombre: String,
        #[arg(long, default_value = "")]
        correo: String,
        #[arg(long, default_value = "")]
        clave: String,
        #[arg(long, default_value = "")]
        telefono: String,
        /// Contact DNIs, comma separated.
        #[arg(long, value_delimiter = ',')]
        amigos: Vec<String>,
    },

    /// Fire generated requests with bounded concurrency and print a report.
    Load {
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Seed for reproducible data.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run the documented example flows end to end.
    Demo,
}

/// Validation stage, persistence stage and client wired over the in-memory
/// backend at the configured endpoints.
struct Stack {
    client: Arc<RpcClient>,
    worker: ValidationWorker,
    stage: PersistenceStage,
}

impl Stack {
    async fn start(config: &AppConfig) -> Result<Self> {
        let backend = InMemoryBackend::from_config(config);
        let broker = backend.bus();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });

        let bootstrap = ValidationBootstrap {
            bus: Arc::clone(&broker),
            registry: backend.registry_connector(),
            registry_policy: config.registry.retry.policy(),
            worker: config.validation_worker(),
        };
        let worker = bootstrap
            .run(config.rebootstrap_delay(), shutdown_rx)
            .await
            .context("interrupted before the validation stage came up")?;

        let stage = PersistenceStage::start(
            Arc::clone(&broker),
            backend.save_handler(),
            Arc::new(SystemClock),
            config.persistence_stage(),
        )
        .await?;

        let client = RpcClient::new(
            broker,
            Arc::new(UlidGenerator::new(SystemClock)),
            config.rpc_client(),
        );
        client.connect().await?;

        Ok(Self {
            client: Arc::new(client),
            worker,
            stage,
        })
    }

    async fn shutdown(self) {
        self.client.close().await;
        self.worker.shutdown().await;
        self.stage.shutdown().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    // Initialize logging - respects RUST_LOG, falls back to the configured level
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Register {
            dni,
            nombre,
            correo,
            clave,
            telefono,
            amigos,
        } => {
            if !is_well_formed_dni(&dni) {
                bail!("DNI debe tener 8 dígitos numéricos");
            }
            let mut request = RegistrationRequest::new(dni, nombre, correo, clave, telefono);
            let contacts = well_formed_contacts(amigos);
            if !contacts.is_empty() {
                request = request.with_contacts(contacts);
            }

            let stack = Stack::start(&config).await?;
            send_and_print(&stack.client, request).await;
            stack.shutdown().await;
        }
        Commands::Load {
            count,
            concurrency,
            seed,
        } => {
            let count = count.unwrap_or(config.load.count);
            let mut driver_config = config.load_driver();
            if let Some(c) = concurrency {
                driver_config.ceiling = c.max(1);
            }

            let stack = Stack::start(&config).await?;
            let sender = Arc::clone(&stack.client) as Arc<dyn RequestSender>;
            let driver = LoadDriver::new(sender, driver_config);
            let mut progress = driver.subscribe();
            let printer = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = *progress.borrow();
                    eprint!(
                        "\rProgreso: {}% ({}/{}) Éxito: {}, Fallo: {}  ",
                        p.percent(),
                        p.settled(),
                        p.total,
                        p.succeeded,
                        p.failed
                    );
                }
            });

            let mut generator = match seed {
                Some(seed) => RequestGenerator::seeded(seed),
                None => RequestGenerator::new(),
            };
            println!("Enviando {count} registros (concurrencia máxima {})...", driver_config.ceiling);
            let report = driver.run(count, |_| generator.next_request()).await;
            drop(driver);
            let _ = printer.await;
            eprintln!();

            println!("--- Resultados Prueba de Carga ---");
            println!("Total de registros intentados: {}", report.issued);
            println!("Exitosos: {}", report.succeeded);
            println!("Fallidos: {}", report.failed);
            println!("Tiempo total: {:.2?}", report.elapsed);
            if let (Some(min), Some(mean), Some(max)) =
                (report.min_latency, report.mean_latency, report.max_latency)
            {
                println!("Latencia min/media/max: {min:.2?} / {mean:.2?} / {max:.2?}");
            }
            println!("Tiempo por registro: {:.2?}", report.time_per_request());
            println!("TPS (éxitos por segundo): {:.2}", report.throughput());
            println!("Pico de solicitudes en vuelo: {}", report.peak_outstanding);

            let stats = stack.worker.stats();
            println!(
                "Validación: recibidos {}, rechazados {}, reenviados {}, pico en vuelo {}",
                stats.received, stats.rejected, stats.forwarded, stats.peak_in_flight
            );
            stack.shutdown().await;
        }
        Commands::Demo => {
            let stack = Stack::start(&config).await?;
            for (title, request) in demo_requests() {
                println!("\n== {title} ==");
                send_and_print(&stack.client, request).await;
            }
            stack.shutdown().await;
        }
    }

    Ok(())
}

/// Keep well-formed contact DNIs, warning about the rest.
fn well_formed_contacts(raw: Vec<String>) -> Vec<String> {
    let trimmed: Vec<String> = raw
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let total = trimmed.len();
    let valid: Vec<String> = trimmed.into_iter().filter(|s| is_well_formed_dni(s)).collect();
    if valid.len() != total {
        tracing::warn!(dropped = total - valid.len(), "malformed contact DNIs were omitted");
        println!("Algunos DNIs de amigos no eran válidos y fueron omitidos.");
    }
    valid
}

fn demo_requests() -> Vec<(&'static str, RegistrationRequest)> {
    let person = |dni: &str, name: &str| {
        RegistrationRequest::new(dni, name, "demo@example.com", "pass1234", "912345678")
    };
    vec![
        ("DNI desconocido", person("99999999", "Nadie")),
        (
            "Amigo desconocido",
            person("20453629", "Juan Pérez").with_contacts(["12345678", "99999999"]),
        ),
        ("Registro válido", person("12345678", "María López")),
        (
            "Registro válido con amigo ya registrado",
            person("20453629", "Juan Pérez").with_contacts(["12345678"]),
        ),
    ]
}

async fn send_and_print(client: &RpcClient, request: RegistrationRequest) {
    println!("Enviando registro para DNI {}...", request.dni);
    let started = Instant::now();
    let result = client.call(&request).await;
    let elapsed = started.elapsed();

    match result {
        Ok(response) => print_response(&response),
        Err(e) => {
            tracing::warn!(kind = ?e.kind(), error = %e, "registration call failed");
            match e.kind() {
                ErrorKind::Timeout => println!("Sin respuesta del servidor: {e}"),
                ErrorKind::Connectivity => println!("No se pudo conectar con el broker: {e}"),
                _ => println!("Error en registro: {e}"),
            }
        }
    }
    println!("Tiempo: {} ms", elapsed.as_millis());
}

fn print_response(response: &ValidationResponse) {
    if response.is_success() {
        println!("OK: {}", response.message);
        if let Some(id) = response.user_id {
            println!("ID asignado: {id}");
        }
        if let Some(linked) = response.linked_contacts.as_ref().filter(|l| !l.is_empty()) {
            println!("Amigos vinculados: {}", linked.join(", "));
        }
    } else {
        println!("Error: {}", response.message);
        if let Some(invalid) = response.invalid_friends.as_ref().filter(|l| !l.is_empty()) {
            println!("DNIs de amigos no encontrados: {}", invalid.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_contacts_are_dropped() {
        let kept = well_formed_contacts(vec![
            "12345678".into(),
            " 87654321 ".into(),
            "1234".into(),
            "abcdefgh".into(),
            "".into(),
        ]);
        assert_eq!(kept, vec!["12345678", "87654321"]);
    }

    #[test]
    fn cli_parses_comma_separated_contacts() {
        let cli = Cli::parse_from([
            "idcheck",
            "register",
            "--dni",
            "20453629",
            "--nombre",
            "Juan",
            "--amigos",
            "12345678,99999999",
        ]);
        match cli.command {
            Commands::Register { amigos, .. } => assert_eq!(amigos, vec!["12345678", "99999999"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["idcheck", "load", "--count", "10", "--config", "idcheck.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("idcheck.toml")));
    }
}
