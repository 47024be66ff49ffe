//! Authenticator microservice entrypoint: serves the gateway's `Handler::Authenticate` RPC
//! (spec §4.5) over `tonic`, loading its user table from a JSON file the way the teacher's
//! `server/services/authenticator/src/main.rs` loads its client file.
//!
//! `Handle`/`Raw` are not implemented by this service — it registers only for the
//! `authenticate:user` remote action (spec §4.7 #1), so the gateway never routes those calls
//! here.

mod core;

use clap::{App, Arg};
use flux::logging;
use gateway_proto::v1::handler_server::{Handler, HandlerServer};
use gateway_proto::v1::{
    AuthenticateRequest, AuthenticateResponse, HandleRequest, HandleResponse, RawRequest, RawResponse,
};
use hashbrown::HashMap;
use std::fs;
use tonic::{Request, Response, Status};

use crate::core::{Authenticator, Decision, UserInfo};

/// Sentinel the gateway's handshake path treats as "no symmetric key, proceed unencrypted"
/// (`gateway-proto/proto/handler.proto`'s `AuthenticateRequest` doc comment).
const NO_CERT: &str = "NO_CERT";

struct AuthenticatorService {
    authenticator: Authenticator,
}

#[tonic::async_trait]
impl Handler for AuthenticatorService {
    async fn handle(&self, _request: Request<HandleRequest>) -> Result<Response<HandleResponse>, Status> {
        Err(Status::unimplemented("this service only handles authenticate"))
    }

    async fn authenticate(
        &self,
        request: Request<AuthenticateRequest>,
    ) -> Result<Response<AuthenticateResponse>, Status> {
        let req = request.into_inner();
        if req.r#type != "user" {
            return Ok(Response::new(AuthenticateResponse {
                ok: false,
                key: String::new(),
                auth: None,
            }));
        }

        let response = match self.authenticator.authenticate(&req.id) {
            Decision::Ok { user_id } => {
                // The gateway already derived the session's symmetric key from the client's
                // RSA-sealed handshake secret; trusting it back keeps the same key on both
                // ends instead of layering a second one (spec §4.4).
                let key = if req.secret.is_empty() { NO_CERT.to_string() } else { req.secret };
                AuthenticateResponse {
                    ok: true,
                    key,
                    auth: Some(gateway_proto::v1::Authentication {
                        kind: "user".to_string(),
                        id: req.id,
                        iid: None,
                        sn: None,
                        company_id: None,
                        user_id: Some(user_id),
                        protocol: None,
                    }),
                }
            }
            Decision::Banned(_) | Decision::NotFound => AuthenticateResponse {
                ok: false,
                key: String::new(),
                auth: None,
            },
        };

        Ok(Response::new(response))
    }

    async fn raw(&self, _request: Request<RawRequest>) -> Result<Response<RawResponse>, Status> {
        Err(Status::unimplemented("this service only handles authenticate"))
    }
}

#[tokio::main]
async fn main() {
    let matches = App::new("Gateway Authenticator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Serves the gateway's remote authenticate action.")
        .arg(
            Arg::with_name("LISTEN_ADDR")
                .help("Address to serve the Handler RPC on, e.g. 0.0.0.0:9100")
                .required(true),
        )
        .arg(
            Arg::with_name("USER_FILE")
                .help("Path to the user table JSON file")
                .required(true),
        )
        .get_matches();

    let listen_addr: std::net::SocketAddr = matches
        .value_of("LISTEN_ADDR")
        .unwrap()
        .parse()
        .expect("LISTEN_ADDR must be a valid socket address");
    let user_file_path = matches.value_of("USER_FILE").unwrap();

    let users: HashMap<String, UserInfo> =
        serde_json::from_reader(fs::File::open(user_file_path).expect("error opening user file"))
            .expect("error parsing user file");

    let log = logging::init();
    logging::info!(log, "starting authenticator"; "listen_addr" => listen_addr.to_string(), "users" => users.len());

    let service = AuthenticatorService {
        authenticator: Authenticator::new(users, &log),
    };

    tonic::transport::Server::builder()
        .add_service(HandlerServer::new(service))
        .serve(listen_addr)
        .await
        .expect("authenticator gRPC server failed");
}
