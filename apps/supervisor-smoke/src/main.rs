mod config;
mod logging;

use std::{process, sync::Arc, time::Duration};

use session_core::{
    BroadcastHub, Clock, ConnectionEvent, ConnectionState, CredentialState, SystemClock,
};
use session_platform::{JsonFileCredentialStore, JsonFileProjectionStore};
use session_runtime::{
    Collaborators, InstanceRegistry, SessionController,
    testing::{ScriptStep, ScriptedTransport},
};

use crate::config::SupervisorConfig;

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const STEP_DELAY: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SupervisorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };
    tracing::info!(
        data_dir = %config.data_dir.display(),
        default_instance = %config.default_instance_id,
        "starting supervisor smoke run"
    );

    let mut credentials = CredentialState::default();
    credentials.insert("smoke_device", "paired");
    let transport = ScriptedTransport::new().with_script(vec![
        ScriptStep::new(
            STEP_DELAY,
            ConnectionEvent::PairingCodeIssued("2@smoke-pairing-code".to_owned()),
        ),
        ScriptStep::new(STEP_DELAY, ConnectionEvent::CredentialsChanged(credentials)),
        ScriptStep::new(STEP_DELAY, ConnectionEvent::Opened),
    ]);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let controller = SessionController::new(
        Collaborators {
            transport: Arc::new(transport),
            credentials: Arc::new(JsonFileCredentialStore::new(&config.data_dir)),
            projection: Arc::new(JsonFileProjectionStore::new(&config.data_dir)),
            hub: Arc::new(BroadcastHub::new(config.log_capacity, Arc::clone(&clock))),
            registry: Arc::new(InstanceRegistry::new()),
            clock,
        },
        config.controller_settings(),
    );

    let (_, mut frames) = controller.subscribe(config.observer_buffer);
    let printer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match serde_json::to_string(&frame) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "failed to encode hub frame"),
            }
        }
    });

    controller.connect(None).await;
    let connected = tokio::time::timeout(CONNECT_DEADLINE, async {
        while controller.status(None).connection_state != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();

    if connected {
        match controller.projection(None) {
            Ok(record) => tracing::info!(?record, "projection after connect"),
            Err(err) => tracing::warn!(code = %err.code, "projection unavailable: {}", err.message),
        }
    } else {
        tracing::error!(status = ?controller.status(None), "instance did not connect in time");
    }

    let status = controller.disconnect(None).await;
    tracing::info!(?status, "disconnected");
    controller.shutdown().await;
    drop(controller);

    if tokio::time::timeout(Duration::from_secs(2), printer)
        .await
        .is_err()
    {
        tracing::warn!("frame printer did not drain in time");
    }

    if !connected {
        process::exit(1);
    }
}
