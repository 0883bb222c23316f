//! Network Server Simulator
//!
//! Crafts a MIC-valid Join-Request for a provisioned device, sends it to
//! the Join Server over the development UDP protocol, decrypts the
//! Join-Accept like the end device would, and then fetches the AppSKey
//! back as the Application Server. Useful for testing without a real NS.
//!
//! Usage: cargo run --bin ns-sim [server_addr] [dev_nonce]
//!
//! The device constants match demos/devices.example.json.

use std::env;
use std::net::SocketAddr;

use base64::Engine;
use tokio::net::UdpSocket;
use tokio::time::Duration;

use lora_joinserver::crypto;
use lora_joinserver::server::protocol::{
    AppSKeyAnsBody, ErrorBody, JoinAnsBody, JoinReqBody, Packet, PacketType, SessionKeyReqBody,
};
use lora_joinserver::types::{AES128Key, EUI64};

const NS_ADDRESS: &str = "ns.cluster.example.com";
const AS_ADDRESS: &str = "as.cluster.example.com";

fn join_eui() -> EUI64 {
    "42ffffffffffffff".parse().unwrap()
}

fn dev_eui() -> EUI64 {
    "4242ffffffffffff".parse().unwrap()
}

fn app_key() -> AES128Key {
    "000102030405060708090a0b0c0d0e0f".parse().unwrap()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;
    let dev_nonce: u16 = env::args().nth(2).unwrap_or_else(|| "1".to_string()).parse()?;

    println!("📡 Network Server Simulator");
    println!("  Target: {}", server_addr);
    println!("  DevEUI: {}  JoinEUI: {}", dev_eui(), join_eui());
    println!("  DevNonce: {}", dev_nonce);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    // Join-Request, MIC'd under the AppKey (1.0.2 device).
    let mut phy = Vec::with_capacity(23);
    phy.push(0x00); // MHDR: JoinRequest, LoRaWAN R1
    phy.extend_from_slice(&join_eui().to_le_bytes());
    phy.extend_from_slice(&dev_eui().to_le_bytes());
    phy.extend_from_slice(&dev_nonce.to_le_bytes());
    let mic = crypto::join_request_mic(&app_key(), &phy)?;
    phy.extend_from_slice(&mic);

    let req = JoinReqBody {
        sender_address: NS_ADDRESS.to_string(),
        mac_version: "1.0.2".to_string(),
        net_id: "000001".parse().unwrap(),
        dev_addr: Some("01020304".parse().unwrap()),
        dl_settings: 0x00,
        rx_delay: 1,
        cf_list: None,
        phy_payload: b64(&phy),
    };

    println!("🚀 Sending JOIN_REQ ({} byte PHY payload)", phy.len());
    let answer = exchange(&socket, server_addr, 1, PacketType::JoinReq, &req).await?;

    let session_key_id = match answer {
        Answer::Body(PacketType::JoinAns, body) => {
            let ans: JoinAnsBody = serde_json::from_slice(&body)?;
            let accept = base64::engine::general_purpose::STANDARD.decode(&ans.phy_payload)?;
            println!("   ✅ JOIN_ANS: {} byte Join-Accept", accept.len());

            // Recover the plaintext the way the device does and check the MIC.
            let body = crypto::decrypt_join_accept(&app_key(), &accept[1..])?;
            let mut plaintext = vec![accept[0]];
            plaintext.extend_from_slice(&body[..body.len() - 4]);
            let mic = crypto::legacy_join_accept_mic(&app_key(), &plaintext)?;
            if body[body.len() - 4..] == mic {
                println!("   ✅ Join-Accept MIC verifies under AppKey");
            } else {
                println!("   ❌ Join-Accept MIC does NOT verify");
            }
            println!(
                "   JoinNonce: {:02x}{:02x}{:02x} (LE)",
                body[2], body[1], body[0]
            );

            println!("   Session key ID: {}", ans.session_keys.session_key_id);
            if let Some(ke) = &ans.session_keys.f_nwk_s_int_key {
                println!("   NwkSKey:  {}", ke.key);
            }
            if let Some(ke) = &ans.session_keys.app_s_key {
                println!("   AppSKey:  {}", ke.key);
            }
            ans.session_keys.session_key_id
        }
        Answer::Body(other, _) => {
            println!("   ⚠️  Unexpected answer type {:?}", other);
            return Ok(());
        }
        Answer::Error(err) => {
            println!("   ❌ Join rejected ({}): {}", err.category, err.message);
            return Ok(());
        }
    };
    println!();

    // Fetch the AppSKey back, as the Application Server would.
    let req = SessionKeyReqBody {
        sender_address: AS_ADDRESS.to_string(),
        dev_eui: dev_eui(),
        session_key_id,
    };
    println!("🔑 Sending APP_SKEY_REQ");
    match exchange(&socket, server_addr, 2, PacketType::AppSKeyReq, &req).await? {
        Answer::Body(PacketType::AppSKeyAns, body) => {
            let ans: AppSKeyAnsBody = serde_json::from_slice(&body)?;
            println!("   ✅ APP_SKEY_ANS: AppSKey {}", ans.app_s_key.key);
        }
        Answer::Body(other, _) => println!("   ⚠️  Unexpected answer type {:?}", other),
        Answer::Error(err) => {
            println!("   ❌ Rejected ({}): {}", err.category, err.message)
        }
    }

    println!();
    println!("✨ Simulation complete!");
    Ok(())
}

enum Answer {
    Body(PacketType, Vec<u8>),
    Error(ErrorBody),
}

async fn exchange<T: serde::Serialize>(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    token: u16,
    packet_type: PacketType,
    body: &T,
) -> anyhow::Result<Answer> {
    let json = serde_json::to_vec(body)?;
    let frame = Packet::encode(token, packet_type, &json);
    socket.send_to(&frame, server_addr).await?;

    let mut buf = [0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .map_err(|_| anyhow::anyhow!("No answer (timeout)"))??;

    let packet = Packet::parse(&buf[..len])?;
    if packet.token != token {
        return Err(anyhow::anyhow!(
            "Token mismatch: sent 0x{:04x}, got 0x{:04x}",
            token,
            packet.token
        ));
    }
    if packet.packet_type == PacketType::ErrorAns {
        let err: ErrorBody = serde_json::from_slice(&packet.body)?;
        return Ok(Answer::Error(err));
    }
    Ok(Answer::Body(packet.packet_type, packet.body))
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}
