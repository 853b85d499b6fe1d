//! Binary entry point: load configuration, build the filter chain, then
//! run either the batch dump decoder or the live subscription driver.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tanglescope::batch::BatchDecoder;
use tanglescope::config::{build_filters, Config};
use tanglescope::subscriber::{RedisFrameSource, Subscriber};

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let filter =
        EnvFilter::try_new(&config.logger.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(version) = &config.version {
        info!("version: {}", version.version);
    }

    let (chain, time_filters) = match build_filters(&config.filters) {
        Ok(built) => built,
        Err(err) => {
            error!(error = %err, "invalid filter configuration");
            std::process::exit(1);
        }
    };
    info!(predicates = chain.len(), "filter chain built");

    if let Some(batch) = &config.batch {
        let decoder =
            BatchDecoder::new(&batch.input_dir, &batch.output_dir, chain, time_filters);
        match decoder.run().await {
            Ok(outcomes) => {
                let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
                info!(files = outcomes.len(), failed, "batch decode finished");
            }
            Err(err) => {
                error!(error = %err, "batch decode failed");
                std::process::exit(1);
            }
        }
    } else if let Some(subscription) = &config.subscription {
        let source = match RedisFrameSource::connect(&subscription.url, &subscription.topic).await
        {
            Ok(source) => source,
            Err(err) => {
                error!(error = %err, "cannot connect to transport");
                std::process::exit(1);
            }
        };
        let subscriber =
            Subscriber::new(chain).with_queue_capacity(subscription.queue_capacity);
        if let Err(err) = subscriber.run(source).await {
            error!(error = %err, "subscription driver stopped on fault");
            std::process::exit(1);
        }
    } else {
        eprintln!("configuration error: neither [batch] nor [subscription] is configured");
        std::process::exit(1);
    }
}
