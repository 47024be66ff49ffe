//! Gateway process entrypoint (spec §6 "Environment & CLI"): loads the gateway config, wires a
//! transport engine matching its `socket_type`, and serves the five control-plane RPC services
//! over `tonic`.
//!
//! Grounded on `server/services/authenticator/src/main.rs`'s CLI/logging wiring style (`clap`
//! + `flux::logging`), adapted from a one-shot rocket launch into a long-running gateway.

use clap::{App, Arg};
use flux::logging;
use gateway_core::action::RemoteCaller;
use gateway_core::config::{GatewayConfig, SocketType};
use gateway_core::discovery::{Discovery, InMemoryDiscovery};
use gateway_core::rpc;
use gateway_core::server::Gateway;
use gateway_core::transport::http_long_poll::HttpLongPollEngine;
use gateway_core::transport::mqtt::{MqttEngine, TopicTemplate};
use gateway_core::transport::tcp::TcpEngine;
use gateway_core::transport::udp::{UdpEngine, UdpMode};
use gateway_core::transport::wss::WssEngine;
use gateway_core::transport::Engine;
use gateway_proto::v1::bind_server::BindServer;
use gateway_proto::v1::conn_server::ConnServer;
use gateway_proto::v1::group_server::GroupServer;
use gateway_proto::v1::message_server::MessageServer;
use gateway_proto::v1::slb_server::SlbServer;
use std::sync::Arc;

fn spawn_engine(gateway: &Arc<Gateway>) -> Arc<dyn Engine> {
    let config = &gateway.config;
    let engine: Arc<dyn Engine> = match config.socket_type {
        SocketType::Tcp => TcpEngine::new(gateway.clone(), config.listen_addr.clone()),
        SocketType::Udp => UdpEngine::new(gateway.clone(), config.listen_addr.clone(), UdpMode::Unicast, None),
        SocketType::Wss => WssEngine::new(gateway.clone(), config.listen_addr.clone()),
        SocketType::HttpLongPoll => HttpLongPollEngine::new(gateway.clone(), config.listen_addr.clone()),
        SocketType::Mqtt => {
            let mqtt = config
                .mqtt
                .as_ref()
                .expect("socket_type mqtt requires a [mqtt] config section");
            let topics = vec![
                TopicTemplate {
                    template: mqtt.raw_topic_template.clone(),
                    response_template: None,
                },
                TopicTemplate {
                    template: mqtt.action_topic_template.clone(),
                    response_template: None,
                },
            ];
            MqttEngine::new(gateway.clone(), mqtt.broker_url.clone(), topics)
        }
    };
    tokio::spawn(engine.clone().run());
    engine
}

#[tokio::main]
async fn main() {
    let matches = App::new("Gateway Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the protocol gateway.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the gateway config file")
                .required(true),
        )
        .arg(
            Arg::with_name("LOG_CONFIG_FILE")
                .long("log-config")
                .takes_value(true)
                .help("Path to the logging config file (defaults to a terminal sink)"),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = GatewayConfig::from_toml_file(config_file_path).expect("error parsing gateway config file");

    let log = match matches.value_of("LOG_CONFIG_FILE") {
        Some(path) => logging::build(&logging::from_config_file(path)),
        None => logging::init(),
    };

    logging::info!(log, "starting gateway"; "name" => config.name.clone(), "listen_addr" => config.listen_addr.clone());

    let rpc_listen_addr: std::net::SocketAddr = config
        .rpc_listen_addr
        .parse()
        .expect("rpc_listen_addr must be a valid socket address");

    let remote_caller: Arc<dyn RemoteCaller> = rpc::remote::RemoteHandlerCaller::new(&log);
    let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());

    let channel = config.name.clone();
    let gateway = Arc::new(Gateway::new(config, &log, remote_caller, discovery));
    gateway.watch_discovery(&channel);

    let _engine = spawn_engine(&gateway);

    logging::info!(log, "serving control plane"; "rpc_listen_addr" => rpc_listen_addr.to_string());

    tonic::transport::Server::builder()
        .add_service(BindServer::new(rpc::bind::BindService::new(gateway.clone())))
        .add_service(ConnServer::new(rpc::conn::ConnService::new(gateway.clone())))
        .add_service(GroupServer::new(rpc::group::GroupService::new(gateway.clone())))
        .add_service(MessageServer::new(rpc::message::MessageService::new(gateway.clone())))
        .add_service(SlbServer::new(rpc::slb::SlbService::new(gateway.clone())))
        .serve(rpc_listen_addr)
        .await
        .expect("control-plane gRPC server failed");
}
