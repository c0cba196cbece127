use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

pub use workload_operator::{self, telemetry, OperatorBootstrap, OperatorConfig, State};
use workload_operator::reconcilers::{SparkApplicationWorkload, SparkClusterWorkload, SparkHistoryServerWorkload};

#[derive(Debug, clap::Parser)]
struct Arguments {
    #[command(flatten)]
    config: OperatorConfig,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let args: Arguments = Arguments::parse();
    let config = args.config;

    let client = Client::try_default().await?;
    let state = State::default();

    let operators = match OperatorBootstrap::new(client.clone(), config.clone(), &state) {
        Ok(bootstrap) => {
            let clusters = SparkClusterWorkload::new(client.clone()).with_metrics(bootstrap.metrics().clone());
            bootstrap
                .register(clusters)
                .register(SparkApplicationWorkload::new(client.clone()))
                .register(SparkHistoryServerWorkload::new(client))
                .run()
                .await
        }
        Err(err) => Err(err),
    };
    let operators = match operators {
        Ok(operators) => operators,
        Err(err) => {
            error!("Unable to start the operators: {err}");
            std::process::exit(1);
        }
    };
    info!("Started {} operator instance(s)", operators.len());

    if config.metrics {
        // Stops on SIGINT and SIGTERM
        HttpServer::new(move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .wrap(middleware::Logger::default().exclude("/health"))
                .service(index)
                .service(health)
                .service(metrics)
        })
        .bind(("0.0.0.0", config.metrics_port))?
        .shutdown_timeout(5)
        .run()
        .await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    operators.shutdown().await;
    Ok(())
}
