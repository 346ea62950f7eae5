//! End-to-end session flow over a real socket: hello, init packet,
//! field admission, and a portal transfer between two rooms.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use grove_data::{GameData, MapInfo, PortalInfo, Point};
use grove_protocol::opcode::SendOpcode;
use grove_protocol::{
    DecryptContext, EncryptContext, FrameDecoder, PacketWriter, GAME_VERSION, INIT_OPCODE,
};
use grove_server::character::Character;
use grove_server::config::{ChannelConfig, DatabaseConfig};
use grove_server::db::MemoryStore;
use grove_server::script::ScriptManagers;
use grove_server::ChannelServer;

const MAP_A: u32 = 100000000;
const MAP_B: u32 = 100000001;
const CHR_ID: u32 = 1000;

fn test_data() -> Arc<GameData> {
    let mut data = GameData::default();
    data.insert_map(MapInfo {
        id: MAP_A,
        forced_return: None,
        nearest_town: MAP_A,
        seat_count: 0,
        portals: vec![PortalInfo {
            id: 1,
            name: "east".to_owned(),
            pos: Point::new(100, 0),
            target_map: Some(MAP_B),
            target_portal: Some("west".to_owned()),
            script: None,
        }],
        lives: vec![],
        reactors: vec![],
        footholds: vec![],
    });
    data.insert_map(MapInfo {
        id: MAP_B,
        forced_return: None,
        nearest_town: MAP_A,
        seat_count: 0,
        portals: vec![PortalInfo {
            id: 4,
            name: "west".to_owned(),
            pos: Point::new(-100, 0),
            target_map: Some(MAP_A),
            target_portal: Some("east".to_owned()),
            script: None,
        }],
        lives: vec![],
        reactors: vec![],
        footholds: vec![],
    });
    Arc::new(data)
}

/// A minimal client speaking the channel protocol.
struct TestClient {
    stream: TcpStream,
    enc: EncryptContext,
    dec: FrameDecoder,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut hello = [0u8; 16];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(u16::from_le_bytes([hello[0], hello[1]]), 0x000E);
        assert_eq!(u16::from_le_bytes([hello[2], hello[3]]), GAME_VERSION);

        let recv_iv: [u8; 4] = hello[7..11].try_into().unwrap();
        let send_iv: [u8; 4] = hello[11..15].try_into().unwrap();

        Self {
            stream,
            // The server receives with `recv_iv`, so the client sends
            // with it; and vice versa.
            enc: EncryptContext::new(recv_iv, GAME_VERSION),
            dec: FrameDecoder::new(DecryptContext::new(send_iv, GAME_VERSION)),
        }
    }

    async fn send(&mut self, payload: &[u8]) {
        let frame = self.enc.encrypt_frame(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Reads until a frame with `opcode` arrives (skipping others).
    async fn expect_opcode(&mut self, opcode: SendOpcode) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = self.dec.try_next_frame().unwrap() {
                let got = u16::from_le_bytes([frame[0], frame[1]]);
                if got == opcode as u16 {
                    return frame.to_vec();
                }
                continue;
            }

            let mut buf = [0u8; 4096];
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert_ne!(read, 0, "server closed the connection");
            self.dec.queue_bytes(&buf[..read]);
        }
    }
}

#[tokio::test]
async fn session_joins_and_transfers_through_a_portal() {
    let store = Arc::new(MemoryStore::new());
    store.seed_character(Character::new(CHR_ID, "traveler".to_owned(), MAP_A));

    let config = ChannelConfig {
        database: DatabaseConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            user: "grove".to_owned(),
            password: None,
            db: "grove".to_owned(),
        },
        listen: "127.0.0.1:0".to_owned(),
    };

    let server = ChannelServer::bind_on(
        0,
        config,
        test_data(),
        store.clone(),
        Arc::new(ScriptManagers::table_driven()),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TestClient::connect(addr).await;

    // First packet: the session id handed out by the login server.
    let mut init = PacketWriter::new(INIT_OPCODE);
    init.write_u32(CHR_ID);
    client.send(&init.into_bytes()).await;

    // The init burst starts with the field itself.
    let set_field = client.expect_opcode(SendOpcode::SetField).await;
    assert!(set_field.len() > 8);

    // Walk through the portal to the neighboring map.
    let mut portal = PacketWriter::new(0x0026);
    portal.write_u8(0);
    portal.write_u32(u32::MAX);
    portal.write_sized_string("east");
    portal.write_u8(0);
    portal.write_u16(0);
    client.send(&portal.into_bytes()).await;

    // The transfer lands as a map change to MAP_B through portal 4.
    let change = client.expect_opcode(SendOpcode::SetField).await;
    let map = u32::from_le_bytes([change[7], change[8], change[9], change[10]]);
    let portal_id = change[11];
    assert_eq!(map, MAP_B);
    assert_eq!(portal_id, 4);

    // Disconnecting flushes the character at the new map.
    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(saved) = store.saved_document(CHR_ID) {
            assert_eq!(saved.map, MAP_B);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "character was never flushed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
