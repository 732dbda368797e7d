mod config;
mod eventloop;
mod ksem;
mod mqtt;
mod rest;

use anyhow::{Context, Result};
use eventloop::{CommandKind, ControlCommand, Message};
use ksem::{catalog, KsemModbusClient};
use log::{info, warn};
use paho_mqtt::{AsyncClient, ConnectOptionsBuilder, CreateOptionsBuilder, PersistenceType};
use rest::KsemRestClient;
use std::{collections::HashMap, fs::File, net::SocketAddr, sync::Arc};
use tokio::{
    select,
    sync::{mpsc, Mutex},
    time::Duration,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let config_path = if cfg!(debug_assertions) {
        "./ksem2mqtt.yaml"
    } else {
        "/etc/ksem2mqtt.yaml"
    };

    let config = File::open(config_path).with_context(|| format!("Failed to open config file {config_path:?}"))?;

    let config: config::Config =
        serde_yaml::from_reader(config).with_context(|| format!("Failed to parse config file {config_path:?}"))?;

    let mut devices = Vec::new();
    for conf in config.ksem.into_iter().flatten() {
        let catalog = match &conf.registers {
            Some(defs) => catalog::RegisterCatalog::new(defs.clone())
                .with_context(|| format!("Invalid register catalog for {}", conf.name))?,
            None => catalog::default_catalog(),
        };

        let host = conf
            .host
            .parse()
            .with_context(|| format!("Failed to parse host address for {}", conf.name))?;
        let addr = SocketAddr::new(host, conf.port);

        let rest = conf
            .password
            .clone()
            .map(|password| Arc::new(Mutex::new(KsemRestClient::new(conf.host.clone(), password))));

        devices.push((conf, addr, Arc::new(catalog), rest));
    }

    let payloads = {
        let mut payloads = Vec::new();

        for (conf, _, catalog, rest) in &devices {
            let info = match rest {
                Some(rest) => rest.lock().await.device_info().await.ok(),
                None => None,
            };

            payloads.extend(mqtt::ConfigPayload::from_ksem(
                &config.client_id,
                conf,
                catalog,
                info.as_ref(),
                rest.is_some(),
            ));
        }

        payloads
    };

    let mut mqtt_client = AsyncClient::new(
        CreateOptionsBuilder::new()
            .server_uri(format!(
                "tcp://{host}:{port}",
                host = config.broker,
                port = config.broker_port
            ))
            .client_id(&config.client_id)
            .persistence(PersistenceType::None)
            .finalize(),
    )
    .context("Failed to create MQTT client")?;

    let mqtt_stream = mqtt_client.get_stream(128);

    mqtt_client
        .connect(
            ConnectOptionsBuilder::new()
                .automatic_reconnect(Duration::from_secs(2u64.pow(3)), Duration::from_secs(2u64.pow(12)))
                .max_inflight(128)
                .will_message(mqtt::offline_message(&config.client_id))
                .finalize(),
        )
        .await
        .context("Failed to connect to MQTT broker")?;

    mqtt::announce_online(&config.client_id, &mqtt_client)
        .await
        .context("Failed to announce online status")?;

    mqtt::register_devices(&mqtt_client, &payloads)
        .await
        .context("Failed to register devices")?;

    let (tx, mut rx) = mpsc::channel(1);
    let mut command_targets: HashMap<String, (CommandKind, mpsc::Sender<ControlCommand>)> = HashMap::new();

    for (conf, addr, catalog, rest) in devices {
        let dev_id = &conf.device.identifier;
        let state_topic = mqtt::state_topic_for_dev_id(&config.client_id, dev_id);
        let poll_interval = Duration::from_secs(conf.poll_interval_s);

        tokio::spawn(eventloop::poll_event_loop(
            state_topic,
            poll_interval,
            KsemModbusClient::new(addr, conf.unit_id),
            catalog,
            conf.max_gap,
            tx.clone(),
        ));

        if let Some(rest) = rest {
            tokio::spawn(eventloop::system_status_event_loop(
                mqtt::system_state_topic_for_dev_id(&config.client_id, dev_id),
                poll_interval,
                rest.clone(),
                tx.clone(),
            ));

            let (ctl_tx, fut) = eventloop::control_event_loop(conf.name.clone(), rest);
            tokio::spawn(fut);

            command_targets.insert(
                mqtt::charge_mode_command_topic(&config.client_id, dev_id),
                (CommandKind::ChargeMode, ctl_tx.clone()),
            );
            command_targets.insert(
                mqtt::min_pv_command_topic(&config.client_id, dev_id),
                (CommandKind::MinPvPowerQuota, ctl_tx.clone()),
            );
            command_targets.insert(
                mqtt::min_charging_command_topic(&config.client_id, dev_id),
                (CommandKind::MinChargingPowerQuota, ctl_tx),
            );
        }
    }

    tokio::spawn(eventloop::mqtt_message_event_loop(mqtt_stream, tx));

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = mqtt::announce_offline(&config.client_id, &mqtt_client).await;
                break Ok(());
            },
            event = rx.recv() => match event.unwrap() {
                Message::Snapshot(topic, snapshot) => {
                    mqtt::publish_state(&mqtt_client, topic, &snapshot)
                        .await
                        .context("Unable to publish state")?;
                },
                Message::SystemStatus(topic, status) => {
                    mqtt::publish_state(&mqtt_client, topic, &status)
                        .await
                        .context("Unable to publish state")?;
                },
                Message::MqttEvent(msg) => {
                    let payload = match std::str::from_utf8(msg.payload()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("MQTT payload error: {e}");
                            continue;
                        }
                    };

                    info!("MQTT command incoming: topic '{}' payload '{payload}'", msg.topic());

                    let Some((kind, chan)) = command_targets.get(msg.topic()) else {
                        warn!("MQTT command error: unknown command topic {}", msg.topic());
                        continue;
                    };

                    let cmd = match kind {
                        CommandKind::ChargeMode => match payload.parse() {
                            Ok(mode) => ControlCommand::Mode(mode),
                            Err(_) => {
                                warn!("MQTT payload error: unknown charge mode '{payload}'");
                                continue;
                            },
                        },
                        CommandKind::MinPvPowerQuota => match payload.parse() {
                            Ok(quota) => ControlCommand::MinPvPowerQuota(quota),
                            Err(e) => {
                                warn!("MQTT payload error: invalid quota '{payload}': {e}");
                                continue;
                            },
                        },
                        CommandKind::MinChargingPowerQuota => match payload.parse() {
                            Ok(quota) => ControlCommand::MinChargingPowerQuota(quota),
                            Err(e) => {
                                warn!("MQTT payload error: invalid quota '{payload}': {e}");
                                continue;
                            },
                        },
                    };

                    if let Err(_) = chan.send(cmd).await {
                        warn!("Control loop for {} is gone", msg.topic());
                    }
                },
            }
        }
    }
}
