//! Subscribes to user-supplied topics containing `{device_sn}` and optional `{action}`
//! placeholders (spec §4.1 "MQTT"). A topic match with no `{action}` captured is "raw" and
//! bypasses action decoding, publishing its response back on the configured server topic; an
//! "action" topic wraps the captured action id in the standard envelope before entering the
//! dispatch pipeline (SPEC_FULL.md §4).
//!
//! Grounded on `original_source/pkg/socket/engine/custom/mqtt/*.go` and `pkg/mqtt/*.go`. Uses
//! `rumqttc`, the standard pure-Rust MQTT client.

use super::{open_conn, Engine, IoTable};
use crate::codec::ProtoPackageBuilder;
use crate::codec::PackageBuilder;
use crate::conn::{ConnContext, Fd, IdType};
use crate::error::GatewayError;
use crate::event::ConnIo;
use crate::server::Gateway;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use slog::{debug, info, warn};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One subscribed topic template, e.g. `sensors/{device_sn}/telemetry` (raw) or
/// `devices/{device_sn}/action/{action}` (action-carrying).
#[derive(Clone)]
pub struct TopicTemplate {
    pub template: String,
    /// Topic the response (raw mode) or `Pong`/`GatewayErr`-style replies are published to,
    /// with `{device_sn}` substituted. Defaults to `<template>/server` when unset.
    pub response_template: Option<String>,
}

struct ParsedTopic {
    device_sn: String,
    action_id: Option<u32>,
}

fn parse_topic(template: &str, topic: &str) -> Option<ParsedTopic> {
    let template_parts: Vec<&str> = template.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    if template_parts.len() != topic_parts.len() {
        return None;
    }

    let mut device_sn = None;
    let mut action_id = None;

    for (t, v) in template_parts.iter().zip(topic_parts.iter()) {
        match *t {
            "{device_sn}" => device_sn = Some((*v).to_string()),
            "{action}" => action_id = v.parse::<u32>().ok(),
            lit if lit == *v => {}
            _ => return None,
        }
    }

    Some(ParsedTopic {
        device_sn: device_sn?,
        action_id,
    })
}

/// Splits a `host:port` broker URL (schemes, if present, are stripped) into its parts, falling
/// back to the standard unencrypted MQTT port when none is given.
fn split_broker_url(broker_url: &str) -> (String, u16) {
    let without_scheme = broker_url.split("://").last().unwrap_or(broker_url);
    match without_scheme.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (without_scheme.to_string(), 1883),
    }
}

fn response_topic(tpl: &TopicTemplate, device_sn: &str) -> String {
    let pattern = tpl.response_template.clone().unwrap_or_else(|| format!("{}/server", tpl.template));
    pattern.replace("{device_sn}", device_sn)
}

pub struct MqttEngine {
    gateway: Arc<Gateway>,
    broker_url: String,
    topics: Vec<TopicTemplate>,
    cancel: CancellationToken,
    io_table: Arc<IoTable>,
    by_sn: RwLock<HashMap<String, Fd>>,
}

impl MqttEngine {
    pub fn new(gateway: Arc<Gateway>, broker_url: String, topics: Vec<TopicTemplate>) -> Arc<MqttEngine> {
        Arc::new(MqttEngine {
            gateway,
            broker_url,
            topics,
            cancel: CancellationToken::new(),
            io_table: Arc::new(IoTable::new()),
            by_sn: RwLock::new(HashMap::new()),
        })
    }

    fn conn_for_sn(self: &Arc<Self>, client: &AsyncClient, device_sn: &str) -> Arc<ConnContext> {
        if let Some(fd) = self.by_sn.read().unwrap().get(device_sn).copied() {
            if let Some(ctx) = self.gateway.registry.get_fd_conn(fd) {
                return ctx;
            }
        }

        let ctx = open_conn(&self.gateway, None, None);
        self.gateway.registry.bind_id(&ctx, IdType::Sn, device_sn.to_string());
        // Raw MQTT has no client-visible handshake; synthesize the `device@<sn>@proto::`
        // authentication internally (SPEC_FULL.md §4 "MQTT raw vs. action topics").
        *ctx.state.lock().unwrap() = crate::conn::ConnState::Authed;
        *ctx.codec.lock().unwrap() = Some(crate::codec::Codec {
            framer: Box::new(crate::codec::WebSocketFramer),
            package: Box::new(ProtoPackageBuilder),
        });

        self.by_sn.write().unwrap().insert(device_sn.to_string(), ctx.fd);
        let io: Arc<dyn ConnIo> = Arc::new(MqttConnIo {
            client: client.clone(),
            publish_topic: None,
        });
        self.io_table.insert(ctx.clone(), io);
        ctx
    }
}

#[async_trait::async_trait]
impl Engine for MqttEngine {
    async fn run(self: Arc<Self>) {
        let (host, port) = split_broker_url(&self.broker_url);
        let mut options = MqttOptions::new("gateway-mqtt-engine", host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 128);

        for tpl in &self.topics {
            let filter = tpl.template.replace("{device_sn}", "+").replace("{action}", "+");
            if let Err(err) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                warn!(self.gateway.log, "mqtt subscribe failed"; "topic" => filter.as_str(), "error" => %err);
            }
        }

        info!(self.gateway.log, "listening"; "broker" => self.broker_url.as_str(), "transport" => "mqtt");

        self.gateway.register_io_table(self.io_table.clone());
        let io_table = self.io_table.clone();
        self.gateway.spawn_tick_loop(move || io_table.snapshot());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = eventloop.poll() => {
                    match polled {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_publish(&client, &publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(self.gateway.log, "mqtt connection error"; "error" => %err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl MqttEngine {
    async fn handle_publish(self: &Arc<Self>, client: &AsyncClient, topic: &str, payload: &[u8]) {
        let matched = self.topics.iter().find_map(|tpl| parse_topic(&tpl.template, topic).map(|parsed| (tpl, parsed)));
        let (tpl, parsed) = match matched {
            Some(m) => m,
            None => return,
        };

        let ctx = self.conn_for_sn(client, &parsed.device_sn);
        let reply_topic = response_topic(tpl, &parsed.device_sn);
        let io: Arc<dyn ConnIo> = Arc::new(MqttConnIo {
            client: client.clone(),
            publish_topic: Some(reply_topic),
        });

        match parsed.action_id {
            // Action topic: wrap the payload in the standard envelope before dispatch
            // (SPEC_FULL.md §4).
            Some(action_id) => {
                let envelope = ProtoPackageBuilder.encode(action_id, payload);
                self.gateway.event.on_traffic(ctx, io.as_ref(), &envelope).await;
            }
            // Raw topic: bypass action decoding entirely, handing the opaque payload straight
            // to the `raw:mqtt` handler (spec §4.1, scenario f).
            None => {
                let auth = ctx.auth.lock().unwrap().clone();
                let protocol = auth.as_ref().and_then(|a| a.protocol.clone()).unwrap_or_else(|| "mqtt".to_string());
                match self.gateway.actions.raw(ctx.clone(), &protocol, 0, payload.to_vec(), "proto").await {
                    Ok(response) if !response.data.is_empty() => {
                        let _ = io.write(response.data).await;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(self.gateway.log, "mqtt raw dispatch failed"; "sn" => parsed.device_sn.as_str(), "error" => %err),
                }
            }
        }
    }
}

struct MqttConnIo {
    client: AsyncClient,
    /// `None` for the idle io-table entry (no request in flight to reply to); `Some` for the
    /// per-publish io created while handling one message.
    publish_topic: Option<String>,
}

impl ConnIo for MqttConnIo {
    fn write(&self, bytes: Vec<u8>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let client = self.client.clone();
        let topic = self.publish_topic.clone();
        Box::pin(async move {
            let topic = match topic {
                Some(t) => t,
                None => return Ok(()),
            };
            client
                .publish(topic, QoS::AtLeastOnce, false, bytes)
                .await
                .map_err(|_| GatewayError::InternalErr)
        })
    }

    fn close(&self, _reason: &str) -> BoxFuture<'static, Result<(), GatewayError>> {
        Box::pin(async { Ok(()) })
    }

    fn is_message_oriented(&self) -> bool {
        true
    }
}
