//! UDP server exposing the join engine over the development protocol.
//!
//! Each datagram is handled in its own task: the engine runs parallel per
//! request, and a caller that goes away cannot cancel a join commit that
//! is already in flight.

pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::joinserver::{CallerContext, JoinRequest, JoinServer, SessionKeyRequest};
use crate::lorawan::{CFList, DLSettings};
use protocol::{
    AppSKeyAnsBody, ErrorBody, JoinAnsBody, JoinReqBody, NwkSKeysAnsBody, Packet, PacketType,
    SessionKeyReqBody,
};

/// Run the Join Server UDP front end until the socket fails.
pub async fn run_server(bind: &str, join_server: Arc<JoinServer>) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    info!("Join Server listening on {}", bind);

    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        debug!("Received {} bytes from {}", len, src);

        match Packet::parse(&buf[..len]) {
            Ok(packet) => {
                let socket = Arc::clone(&socket);
                let join_server = Arc::clone(&join_server);
                tokio::spawn(async move {
                    handle_packet(&socket, src, &join_server, packet).await;
                });
            }
            Err(e) => {
                warn!("Failed to parse frame from {}: {}", src, e);
            }
        }
    }
}

async fn handle_packet(
    socket: &UdpSocket,
    src: SocketAddr,
    join_server: &JoinServer,
    packet: Packet,
) {
    let result = match packet.packet_type {
        PacketType::JoinReq => handle_join_req(join_server, &packet.body).await,
        PacketType::AppSKeyReq => handle_app_s_key_req(join_server, &packet.body).await,
        PacketType::NwkSKeysReq => handle_nwk_s_keys_req(join_server, &packet.body).await,
        other => {
            warn!("Unexpected packet type {:?} from {}", other, src);
            return;
        }
    };

    let (packet_type, body) = match result {
        Ok(answer) => answer,
        Err(err) => {
            debug!("Request from {} failed: {} ({})", src, err.message, err.category);
            let body =
                serde_json::to_vec(&err).expect("failed to serialize error body");
            (PacketType::ErrorAns, body)
        }
    };

    let frame = Packet::encode(packet.token, packet_type, &body);
    if let Err(e) = socket.send_to(&frame, src).await {
        error!("Failed to send answer to {}: {}", src, e);
    }
}

async fn handle_join_req(
    join_server: &JoinServer,
    body: &[u8],
) -> Result<(PacketType, Vec<u8>), ErrorBody> {
    let req: JoinReqBody = serde_json::from_slice(body)
        .map_err(|e| ErrorBody::input(format!("invalid JOIN_REQ body: {e}")))?;

    let selected_mac_version = req
        .mac_version
        .parse()
        .map_err(|_| ErrorBody::input(format!("unsupported MAC version {}", req.mac_version)))?;
    let raw_payload = base64::engine::general_purpose::STANDARD
        .decode(&req.phy_payload)
        .map_err(|e| ErrorBody::input(format!("invalid PHY payload base64: {e}")))?;
    let cf_list = match &req.cf_list {
        Some(s) => {
            let bytes = hex::decode(s)
                .map_err(|e| ErrorBody::input(format!("invalid CFList hex: {e}")))?;
            let arr: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ErrorBody::input("CFList must be 16 bytes"))?;
            Some(CFList(arr))
        }
        None => None,
    };

    let ctx = CallerContext {
        net_address: req.sender_address.clone(),
    };
    let join_req = JoinRequest {
        selected_mac_version,
        net_id: req.net_id,
        dev_addr: req.dev_addr,
        downlink_settings: DLSettings::from_byte(req.dl_settings),
        rx_delay: req.rx_delay,
        cf_list,
        raw_payload: Some(raw_payload),
        payload: None,
    };

    let resp = join_server
        .handle_join(&ctx, &join_req)
        .await
        .map_err(|e| ErrorBody::from(&e))?;
    let answer = JoinAnsBody {
        phy_payload: base64::engine::general_purpose::STANDARD.encode(&resp.raw_payload),
        session_keys: resp.session_keys,
    };
    let body = serde_json::to_vec(&answer).expect("failed to serialize JOIN_ANS body");
    Ok((PacketType::JoinAns, body))
}

async fn handle_app_s_key_req(
    join_server: &JoinServer,
    body: &[u8],
) -> Result<(PacketType, Vec<u8>), ErrorBody> {
    let (ctx, req) = parse_session_key_req(body)?;
    let resp = join_server
        .get_app_s_key(&ctx, &req)
        .await
        .map_err(|e| ErrorBody::from(&e))?;
    let answer = AppSKeyAnsBody {
        app_s_key: resp.app_s_key,
    };
    let body = serde_json::to_vec(&answer).expect("failed to serialize APP_SKEY_ANS body");
    Ok((PacketType::AppSKeyAns, body))
}

async fn handle_nwk_s_keys_req(
    join_server: &JoinServer,
    body: &[u8],
) -> Result<(PacketType, Vec<u8>), ErrorBody> {
    let (ctx, req) = parse_session_key_req(body)?;
    let resp = join_server
        .get_nwk_s_keys(&ctx, &req)
        .await
        .map_err(|e| ErrorBody::from(&e))?;
    let answer = NwkSKeysAnsBody {
        nwk_s_enc_key: resp.nwk_s_enc_key,
        f_nwk_s_int_key: resp.f_nwk_s_int_key,
        s_nwk_s_int_key: resp.s_nwk_s_int_key,
    };
    let body = serde_json::to_vec(&answer).expect("failed to serialize NWK_SKEYS_ANS body");
    Ok((PacketType::NwkSKeysAns, body))
}

fn parse_session_key_req(body: &[u8]) -> Result<(CallerContext, SessionKeyRequest), ErrorBody> {
    let req: SessionKeyReqBody = serde_json::from_slice(body)
        .map_err(|e| ErrorBody::input(format!("invalid session key request body: {e}")))?;
    Ok((
        CallerContext {
            net_address: req.sender_address,
        },
        SessionKeyRequest {
            dev_eui: req.dev_eui,
            session_key_id: req.session_key_id,
        },
    ))
}
