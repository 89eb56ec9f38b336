//! Mock server fidelity tests.
//!
//! These drive the mock with a bare client built from the framing and wire
//! crates, and check that what comes back decodes the way a real server's
//! output would.
//!
//! ```bash
//! cargo test -p tds-testing --test mock_fidelity
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use tds_framing::{BufferPool, MessageReader, PacketWriter};
use tds_testing::{
    LoginBehavior, MockColumn, MockResponse, MockServer, ScalarValue, TokenWriter,
};
use tds_wire::{
    DEFAULT_PACKET_SIZE, EncryptionLevel, Login7, PacketStatus, PacketType, PreLogin, SqlBatch,
    Token, TokenStream,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

struct RawClient<S> {
    reader: MessageReader<ReadHalf<S>>,
    io: WriteHalf<S>,
    writer: PacketWriter,
}

impl<S> RawClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        let (read_half, io) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(read_half),
            io,
            writer: PacketWriter::new(BufferPool::default(), DEFAULT_PACKET_SIZE).unwrap(),
        }
    }

    async fn prelogin(&mut self) -> PreLogin {
        let request = PreLogin::new();
        self.writer
            .write_with(PacketType::PreLogin, PacketStatus::NORMAL, |sink| {
                request.encode(sink)
            })
            .unwrap();
        self.writer.flush(&mut self.io).await.unwrap();
        PreLogin::decode(self.read().await).unwrap()
    }

    async fn login(&mut self, login: Login7) -> Vec<Token> {
        self.writer
            .write_with(PacketType::Tds7Login, PacketStatus::NORMAL, |sink| {
                login.encode(sink)
            })
            .unwrap();
        self.writer.flush(&mut self.io).await.unwrap();
        let payload = self.read().await;
        tokens(payload)
    }

    async fn handshake(&mut self) -> Vec<Token> {
        self.prelogin().await;
        self.login(Login7::new().with_sql_auth("sa", "secret").with_database("sales"))
            .await
    }

    async fn batch(&mut self, batch: SqlBatch) {
        self.writer
            .write_with(PacketType::SqlBatch, PacketStatus::NORMAL, |sink| {
                batch.encode(sink)
            })
            .unwrap();
        self.writer.flush(&mut self.io).await.unwrap();
    }

    async fn read(&mut self) -> Bytes {
        self.reader
            .read_message(PacketType::TabularResult)
            .await
            .unwrap()
            .expect("server closed the connection")
            .payload
    }
}

fn tokens(payload: Bytes) -> Vec<Token> {
    let mut stream = TokenStream::new(payload);
    let mut out = Vec::new();
    while let Some(token) = stream.next_token().unwrap() {
        out.push(token);
    }
    out
}

#[tokio::test]
async fn test_prelogin_answers_configured_encryption() {
    let server = MockServer::builder().build().await.unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    let response = client.prelogin().await;
    assert_eq!(response.encryption, EncryptionLevel::NotSupported);
    assert_eq!(response.version >> 24, 16);

    let server = MockServer::builder()
        .with_encryption(EncryptionLevel::Required)
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    assert!(client.prelogin().await.encryption.demands_tls());
}

#[tokio::test]
async fn test_login_response_sequence() {
    let server = MockServer::builder()
        .with_server_name("FidelityTest")
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    let tokens = client.handshake().await;

    assert_eq!(tokens.len(), 4, "{tokens:?}");
    let Token::EnvChange(database) = &tokens[0] else {
        panic!("expected database ENVCHANGE, got {:?}", tokens[0]);
    };
    assert_eq!(database.new_database(), Some("sales"));
    let Token::EnvChange(packet_size) = &tokens[1] else {
        panic!("expected packet size ENVCHANGE, got {:?}", tokens[1]);
    };
    assert_eq!(packet_size.new_packet_size().unwrap().unwrap(), 4096);
    let Token::LoginAck(ack) = &tokens[2] else {
        panic!("expected LOGINACK, got {:?}", tokens[2]);
    };
    assert_eq!(ack.prog_name, "FidelityTest");
    assert_eq!(ack.server_version(), "16.0.4085");
    assert!(matches!(tokens[3], Token::Done(done) if !done.has_more()));

    let logins = server.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].username, "sa");
    assert_eq!(logins[0].database, "sales");
}

#[tokio::test]
async fn test_rejected_login_sends_error() {
    let server = MockServer::builder()
        .with_login(LoginBehavior::Reject {
            number: 18456,
            message: "Login failed for user 'sa'.".into(),
        })
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    let tokens = client.handshake().await;

    let Token::Error(msg) = &tokens[0] else {
        panic!("expected ERROR, got {:?}", tokens[0]);
    };
    assert_eq!(msg.number, 18456);
    assert!(!tokens.iter().any(|t| matches!(t, Token::LoginAck(_))));
}

#[tokio::test]
async fn test_scripted_rows_decode() {
    let server = MockServer::builder()
        .with_response(
            "SELECT id, name FROM users",
            MockResponse::rows(
                vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
                vec![
                    vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())],
                    vec![ScalarValue::Int(2), ScalarValue::Null],
                ],
            ),
        )
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    client.batch(SqlBatch::new("select id, name from users")).await;

    let tokens = tokens(client.read().await);
    assert_eq!(tokens.len(), 4);
    let Token::Row(first) = &tokens[1] else {
        panic!("expected ROW");
    };
    assert_eq!(first.values[0].as_i32(), Some(1));
    assert_eq!(first.values[1].as_str(), Some("Alice"));
    let Token::Row(second) = &tokens[2] else {
        panic!("expected ROW");
    };
    assert!(second.values[1].is_null());
    assert!(matches!(tokens[3], Token::Done(done) if done.row_count == 2));
}

#[tokio::test]
async fn test_batches_are_recorded_with_descriptor() {
    let server = MockServer::builder().build().await.unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    client
        .batch(SqlBatch::new("UPDATE t SET x = 1").with_transaction(0x42, 1))
        .await;
    client.read().await;

    let batches = server.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].sql, "UPDATE t SET x = 1");
    assert_eq!(batches[0].transaction_descriptor, Some(0x42));
    assert_eq!(batches[0].connection, 1);
}

#[tokio::test]
async fn test_sequence_and_custom_responses() {
    let server = MockServer::builder()
        .with_default_response(MockResponse::custom(|batch| {
            MockResponse::Sequence(vec![
                MockResponse::affected(batch.sql.len() as u64),
                MockResponse::scalar_string(batch.sql.clone()),
            ])
        }))
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    client.batch(SqlBatch::new("abc")).await;

    let tokens = tokens(client.read().await);
    assert!(matches!(tokens[0], Token::Done(done) if done.has_more() && done.row_count == 3));
    let Token::Row(row) = &tokens[2] else {
        panic!("expected ROW");
    };
    assert_eq!(row.values[0].as_str(), Some("abc"));
}

#[tokio::test]
async fn test_raw_tokens_are_framed_verbatim() {
    let raw = TokenWriter::new()
        .info(5701, "Changed database context", "srv")
        .done(tds_wire::DoneStatus::empty(), 0)
        .finish();
    let server = MockServer::builder()
        .with_default_response(MockResponse::Raw(raw.clone()))
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    client.batch(SqlBatch::new("USE sales")).await;
    assert_eq!(client.read().await, raw);
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let server = MockServer::builder()
        .with_default_response(MockResponse::Disconnect)
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    client.batch(SqlBatch::new("SELECT 1")).await;
    let next = client
        .reader
        .read_message(PacketType::TabularResult)
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_delayed_response_waits() {
    let server = MockServer::builder()
        .with_default_response(MockResponse::affected(1).delayed(Duration::from_millis(50)))
        .build()
        .await
        .unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;

    let start = tokio::time::Instant::now();
    client.batch(SqlBatch::new("DELETE FROM t")).await;
    client.read().await;
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_tcp_connections_are_served() {
    let server = MockServer::builder()
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
    let mut client = RawClient::new(stream);
    client.handshake().await;
    client.batch(SqlBatch::new("SELECT 1")).await;
    let tokens = tokens(client.read().await);
    let Token::Row(row) = &tokens[1] else {
        panic!("expected ROW");
    };
    assert_eq!(row.values[0].as_i32(), Some(1));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let server = MockServer::builder().build().await.unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;
    server.stop();
    let next = client
        .reader
        .read_message(PacketType::TabularResult)
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_wait_for_batches() {
    let server = MockServer::builder().build().await.unwrap();
    let mut client = RawClient::new(server.connect_duplex());
    client.handshake().await;

    let waiter = tokio::time::timeout(Duration::from_secs(5), server.wait_for_batches(2));
    let send = async {
        client.batch(SqlBatch::new("SELECT 1")).await;
        client.batch(SqlBatch::new("SELECT 2")).await;
    };
    let (waited, ()) = tokio::join!(waiter, send);
    assert!(waited.is_ok());
    assert_eq!(server.batch_count(), 2);
}

#[tokio::test]
async fn test_multiple_servers_are_independent() {
    let first = MockServer::builder().build().await.unwrap();
    let second = MockServer::builder().build().await.unwrap();
    assert_ne!(first.port(), second.port());
}
