// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Order-status projector worker.
//!
//! Connects to the broker, installs the fulfillment topology, records created
//! orders and applies payment events to them until Ctrl-C.

use eyre::Result;
use fulfillment_bus::{
    channel::LapinConnector,
    config::BrokerConfig,
    connection::ConnectionManager,
    dispatcher::Dispatcher,
    projector::{
        fulfillment_topology, InMemoryOrderStore, OrderIntake, OrderStatusProjector,
        ORDERS_CREATED_QUEUE, PAYMENT_STATUS_QUEUE,
    },
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = BrokerConfig::from_env()?;
    info!(
        uri = config.redacted_uri(),
        connection_name = config.connection_name.as_str(),
        "starting order-status projector"
    );

    let topology = fulfillment_topology(config.retry_policy())?;
    let manager = ConnectionManager::new(Arc::new(LapinConnector), topology, config);

    if let Err(err) = manager.connect().await {
        error!(error = err.to_string(), "broker unavailable");
        return Err(err.into());
    }

    let store = Arc::new(InMemoryOrderStore::new());
    let dispatcher = Dispatcher::new(manager.clone());
    let subscriptions = [
        dispatcher.consume(ORDERS_CREATED_QUEUE, OrderIntake::new(store.clone()))?,
        dispatcher.consume(PAYMENT_STATUS_QUEUE, OrderStatusProjector::new(store))?,
    ];

    let outcome = tokio::select! {
        result = manager.supervise() => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = err.to_string(), "failure to listen for shutdown signal");
            }
            info!("shutdown requested");
            Ok(())
        }
    };

    manager.disconnect().await;
    for subscription in subscriptions {
        subscription.stopped().await;
    }

    if let Err(err) = outcome {
        error!(error = err.to_string(), "broker connection lost for good");
        return Err(err.into());
    }

    info!("order-status projector stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let is_prod = std::env::var("ENVIRONMENT")
        .map(|e| e == "production")
        .unwrap_or(false);

    if is_prod {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}
