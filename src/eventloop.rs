use crate::{
    ksem::{catalog::RegisterCatalog, KsemModbusClient, Snapshot},
    rest::{ChargeMode, ChargeModeSettings, KsemRestClient},
};
use log::{debug, error, warn};
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    time::{self, Duration},
};

const CYCLE_TIMEOUT: Duration = Duration::from_secs(10);

pub enum Message {
    Snapshot(String, Snapshot),
    SystemStatus(String, serde_json::Value),
    MqttEvent(paho_mqtt::Message),
}

/// Control requests routed from MQTT command topics to the REST side.
#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    Mode(ChargeMode),
    MinPvPowerQuota(u32),
    MinChargingPowerQuota(u32),
}

/// Which command a subscribed topic carries.
#[derive(Debug, Clone, Copy)]
pub enum CommandKind {
    ChargeMode,
    MinPvPowerQuota,
    MinChargingPowerQuota,
}

pub fn mqtt_message_event_loop(
    mqtt_stream: paho_mqtt::AsyncReceiver<Option<paho_mqtt::Message>>,
    tx: mpsc::Sender<Message>,
) -> impl Future<Output = ()> {
    async move {
        loop {
            let Ok(event) = mqtt_stream.recv().await else {
                break;
            };

            match event {
                Some(event) => if let Err(_) = tx.send(Message::MqttEvent(event)).await {
                    break;
                },
                None => warn!("Lost connection to MQTT broker"),
            }
        }

        debug!("Shutting down MQTT client");
    }
}

/// Drive poll cycles on a fixed interval. A cycle-level failure (connect
/// error or timeout) publishes nothing and leaves the retry to the next
/// tick; block and definition failures are logged and the partial snapshot
/// is published as is.
pub fn poll_event_loop(
    topic: String,
    poll_interval: Duration,
    mut client: KsemModbusClient,
    catalog: Arc<RegisterCatalog>,
    max_gap: u16,
    tx: mpsc::Sender<Message>,
) -> impl Future<Output = ()> {
    let mut poll_timer = time::interval(poll_interval);
    poll_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    async move {
        if let Err(e) = client.connect().await {
            warn!("{topic}: initial connect failed: {e}");
        }

        loop {
            poll_timer.tick().await;

            match time::timeout(CYCLE_TIMEOUT, client.poll_once(&catalog, max_gap)).await {
                Ok(Ok(outcome)) => {
                    for failure in &outcome.failures {
                        warn!("{topic}: {failure}");
                    }

                    if let Err(_) = tx.send(Message::Snapshot(topic.clone(), outcome.snapshot)).await {
                        break;
                    }
                },
                Ok(Err(e)) => error!("{topic}: poll cycle failed: {e}"),
                Err(_) => {
                    error!("{topic}: poll cycle timed out after {CYCLE_TIMEOUT:?}");
                    client.close().await;
                },
            }
        }

        debug!("Shutting down poll loop for {topic}");
    }
}

/// Publish the meter's system gauges on the poll interval.
pub fn system_status_event_loop(
    topic: String,
    poll_interval: Duration,
    rest: Arc<Mutex<KsemRestClient>>,
    tx: mpsc::Sender<Message>,
) -> impl Future<Output = ()> {
    let mut status_timer = time::interval(poll_interval);
    status_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    async move {
        loop {
            status_timer.tick().await;

            let status = {
                let mut rest = rest.lock().await;
                time::timeout(CYCLE_TIMEOUT, rest.device_status()).await
            };

            match status {
                Ok(Ok(status)) => {
                    if let Err(_) = tx.send(Message::SystemStatus(topic.clone(), status)).await {
                        break;
                    }
                },
                Ok(Err(e)) => warn!("{topic}: status poll failed: {e}"),
                Err(_) => warn!("{topic}: status poll timed out after {CYCLE_TIMEOUT:?}"),
            }
        }

        debug!("Shutting down status loop for {topic}");
    }
}

/// Forward control commands to the charge-mode endpoint, one at a time.
pub fn control_event_loop(
    name: String,
    rest: Arc<Mutex<KsemRestClient>>,
) -> (mpsc::Sender<ControlCommand>, impl Future<Output = ()>) {
    let (tx, mut rx) = mpsc::channel(8);

    let fut = async move {
        while let Some(cmd) = rx.recv().await {
            let overrides = match cmd {
                ControlCommand::Mode(mode) => ChargeModeSettings {
                    mode: Some(mode),
                    ..Default::default()
                },
                ControlCommand::MinPvPowerQuota(quota) => ChargeModeSettings {
                    min_pv_power_quota: Some(quota),
                    ..Default::default()
                },
                ControlCommand::MinChargingPowerQuota(quota) => ChargeModeSettings {
                    min_charging_power_quota: Some(quota),
                    ..Default::default()
                },
            };

            let mut rest = rest.lock().await;
            if let Err(e) = rest.set_charge_mode(overrides).await {
                error!("{name}: charge mode update failed: {e}");
            }
        }

        debug!("Shutting down control loop for {name}");
    };

    (tx, fut)
}
