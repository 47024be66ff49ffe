//! Offline RSA keypair generator for the handshake key-wrap scheme (spec §4.4/§9: the gateway
//! holds the RSA private key, clients are provisioned the public key out of band). Repurposed
//! from the teacher's `server/util/src/bin/gen_keys.rs` serial-key generator — that tool
//! produced client manifest entries for a symmetric scheme this gateway doesn't use; generating
//! the RSA keypair the new handshake actually needs is the equivalent bookkeeping tool.

use clap::{App, Arg};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;

fn main() {
    let matches = App::new("Gateway Key Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates an RSA keypair for the gateway handshake (spec §4.4).")
        .arg(
            Arg::with_name("PRIVATE_KEY_FILE")
                .help("Path the PKCS#8 PEM private key is written to")
                .required(true),
        )
        .arg(
            Arg::with_name("PUBLIC_KEY_FILE")
                .help("Path the PKCS#8 PEM public key is written to")
                .required(true),
        )
        .arg(
            Arg::with_name("BITS")
                .long("bits")
                .takes_value(true)
                .help("RSA modulus size in bits (default 2048)"),
        )
        .get_matches();

    let bits: usize = matches
        .value_of("BITS")
        .map(|v| v.parse().expect("BITS must be a valid integer"))
        .unwrap_or(2048);

    println!("Generating a {}-bit RSA keypair, this may take a moment...", bits);
    let private_key = RsaPrivateKey::new(&mut OsRng, bits).expect("RSA key generation should succeed");
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("encoding the private key should succeed");
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .expect("encoding the public key should succeed");

    let private_path = matches.value_of("PRIVATE_KEY_FILE").unwrap();
    let public_path = matches.value_of("PUBLIC_KEY_FILE").unwrap();

    fs::write(private_path, private_pem.as_bytes()).expect("writing the private key file should succeed");
    fs::write(public_path, public_pem).expect("writing the public key file should succeed");

    println!("Wrote private key to `{}`", private_path);
    println!("Wrote public key to `{}`", public_path);
}
