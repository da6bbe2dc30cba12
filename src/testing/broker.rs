//! Minimal in-process MQTT 3.1.1 broker for tests
//!
//! Frames packets with rumqttc's own v4 codec and answers just enough of the
//! protocol for one client per connection: CONNACK, SUBACK, UNSUBACK, PUBACK,
//! the QoS 2 handshake and PINGRESP. Publishes are echoed back (at QoS 0) when
//! they match one of the connection's own subscriptions. Everything the broker
//! receives is recorded.

use crate::transport::mqtt::topic_matches;
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{Error as CodecError, QoS};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;

/// Largest packet the broker accepts
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A packet received by the fake broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerPacket {
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        clean_session: bool,
        keep_alive: u16,
    },
    Subscribe {
        filter: String,
        qos: u8,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    Disconnect,
}

#[derive(Debug, Default)]
struct Behaviour {
    rejected_filters: Vec<String>,
    silent: bool,
}

type PacketLog = Arc<Mutex<Vec<BrokerPacket>>>;

pub struct FakeBroker {
    addr: SocketAddr,
    packets: PacketLog,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    /// Broker that accepts everything
    pub async fn start() -> std::io::Result<Self> {
        Self::spawn(Behaviour::default()).await
    }

    /// Broker that refuses subscriptions to the given filters
    pub async fn start_rejecting(filters: &[&str]) -> std::io::Result<Self> {
        Self::spawn(Behaviour {
            rejected_filters: filters.iter().map(|f| f.to_string()).collect(),
            silent: false,
        })
        .await
    }

    /// Broker that accepts TCP connections but never answers CONNECT
    pub async fn start_silent() -> std::io::Result<Self> {
        Self::spawn(Behaviour {
            rejected_filters: Vec::new(),
            silent: true,
        })
        .await
    }

    async fn spawn(behaviour: Behaviour) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let packets: PacketLog = Arc::new(Mutex::new(Vec::new()));
        let behaviour = Arc::new(behaviour);

        let log = packets.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!(%peer, "Fake broker accepted connection");
                let log = log.clone();
                let behaviour = behaviour.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &behaviour, &log).await {
                        debug!("Fake broker connection ended: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            packets,
            accept_task,
        })
    }

    /// `tcp://` URL of the broker
    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Everything received so far, in arrival order
    pub fn packets(&self) -> Vec<BrokerPacket> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the packet log until `predicate` holds or `timeout` elapses
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[BrokerPacket]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.packets()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn record(log: &PacketLog, packet: BrokerPacket) {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(packet);
}

async fn serve<S>(mut stream: S, behaviour: &Behaviour, log: &PacketLog) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut incoming = BytesMut::with_capacity(4096);
    let mut outgoing = BytesMut::new();
    let mut subscriptions: Vec<String> = Vec::new();

    while let Some(packet) = read_packet(&mut stream, &mut incoming).await? {
        match packet {
            Packet::Connect(connect) => {
                let (username, password) = match connect.login {
                    Some(login) => (Some(login.username), Some(login.password)),
                    None => (None, None),
                };
                record(
                    log,
                    BrokerPacket::Connect {
                        client_id: connect.client_id,
                        username,
                        password,
                        clean_session: connect.clean_session,
                        keep_alive: connect.keep_alive,
                    },
                );
                if !behaviour.silent {
                    encoded(ConnAck::new(ConnectReturnCode::Success, false).write(&mut outgoing))?;
                }
            }
            Packet::Publish(publish) => {
                match publish.qos {
                    QoS::AtLeastOnce => encoded(PubAck::new(publish.pkid).write(&mut outgoing))?,
                    QoS::ExactlyOnce => encoded(PubRec::new(publish.pkid).write(&mut outgoing))?,
                    QoS::AtMostOnce => {}
                }
                if subscriptions.iter().any(|f| topic_matches(f, &publish.topic)) {
                    let echo = Publish::new(
                        publish.topic.as_str(),
                        QoS::AtMostOnce,
                        publish.payload.to_vec(),
                    );
                    encoded(echo.write(&mut outgoing))?;
                }
                record(
                    log,
                    BrokerPacket::Publish {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: publish.qos as u8,
                        retain: publish.retain,
                    },
                );
            }
            Packet::PubRel(pubrel) => encoded(PubComp::new(pubrel.pkid).write(&mut outgoing))?,
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                for filter in subscribe.filters {
                    if behaviour.rejected_filters.contains(&filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                    } else {
                        codes.push(SubscribeReasonCode::Success(filter.qos));
                        subscriptions.push(filter.path.clone());
                    }
                    record(
                        log,
                        BrokerPacket::Subscribe {
                            filter: filter.path,
                            qos: filter.qos as u8,
                        },
                    );
                }
                encoded(SubAck::new(subscribe.pkid, codes).write(&mut outgoing))?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for filter in unsubscribe.topics {
                    subscriptions.retain(|f| *f != filter);
                    record(log, BrokerPacket::Unsubscribe { filter });
                }
                encoded(UnsubAck::new(unsubscribe.pkid).write(&mut outgoing))?;
            }
            Packet::PingReq => encoded(PingResp.write(&mut outgoing))?,
            Packet::Disconnect => {
                record(log, BrokerPacket::Disconnect);
                return Ok(());
            }
            other => debug!(?other, "Fake broker ignoring packet"),
        }

        if !outgoing.is_empty() {
            stream.write_all(&outgoing).await?;
            outgoing.clear();
        }
    }
    Ok(())
}

/// Next complete packet, or None once the peer closes between packets
async fn read_packet<S>(stream: &mut S, buffer: &mut BytesMut) -> io::Result<Option<Packet>>
where
    S: AsyncRead + Unpin,
{
    loop {
        match v4::read(buffer, MAX_PACKET_SIZE) {
            Ok(packet) => return Ok(Some(packet)),
            Err(CodecError::InsufficientBytes(_)) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }

        if stream.read_buf(buffer).await? == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-packet",
                ))
            };
        }
    }
}

fn encoded(written: Result<usize, CodecError>) -> io::Result<()> {
    written
        .map(|_| ())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::mqttbytes::v4::{Connect, Disconnect, Login, PingReq, Subscribe, Unsubscribe};
    use tokio::io::DuplexStream;

    async fn next(client: &mut DuplexStream, buffer: &mut BytesMut) -> Packet {
        read_packet(client, buffer)
            .await
            .unwrap()
            .expect("broker closed the stream")
    }

    fn serve_in_background(behaviour: Behaviour) -> (DuplexStream, PacketLog) {
        let (client, server) = tokio::io::duplex(4096);
        let log: PacketLog = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();
        tokio::spawn(async move {
            let _ = serve(server, &behaviour, &server_log).await;
        });
        (client, log)
    }

    #[tokio::test]
    async fn test_connect_and_subscribe_are_answered() {
        let (mut client, log) = serve_in_background(Behaviour {
            rejected_filters: vec!["forbidden/#".to_string()],
            silent: false,
        });

        let mut out = BytesMut::new();
        let mut connect = Connect::new("cid");
        connect.keep_alive = 30;
        connect.login = Some(Login::new("user", "pass"));
        connect.write(&mut out).unwrap();
        let mut subscribe = Subscribe::new("a/#", QoS::AtLeastOnce);
        subscribe.pkid = 3;
        subscribe.write(&mut out).unwrap();
        let mut rejected = Subscribe::new("forbidden/#", QoS::AtMostOnce);
        rejected.pkid = 4;
        rejected.write(&mut out).unwrap();
        client.write_all(&out).await.unwrap();

        let mut buffer = BytesMut::new();
        assert!(matches!(next(&mut client, &mut buffer).await, Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success));
        assert_eq!(
            next(&mut client, &mut buffer).await,
            Packet::SubAck(SubAck::new(3, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]))
        );
        assert_eq!(
            next(&mut client, &mut buffer).await,
            Packet::SubAck(SubAck::new(4, vec![SubscribeReasonCode::Failure]))
        );

        let packets = log.lock().unwrap().clone();
        assert_eq!(
            packets[0],
            BrokerPacket::Connect {
                client_id: "cid".to_string(),
                username: Some("user".to_string()),
                password: Some("pass".to_string()),
                clean_session: true,
                keep_alive: 30,
            }
        );
        assert_eq!(
            packets[1],
            BrokerPacket::Subscribe {
                filter: "a/#".to_string(),
                qos: 1
            }
        );
    }

    #[tokio::test]
    async fn test_publish_is_acked_then_echoed() {
        let (mut client, log) = serve_in_background(Behaviour::default());

        let mut out = BytesMut::new();
        Connect::new("echo").write(&mut out).unwrap();
        let mut subscribe = Subscribe::new("sensors/+", QoS::AtMostOnce);
        subscribe.pkid = 1;
        subscribe.write(&mut out).unwrap();
        let mut publish = Publish::new("sensors/1", QoS::AtLeastOnce, b"21.5".to_vec());
        publish.pkid = 2;
        publish.write(&mut out).unwrap();
        let mut exactly_once = Publish::new("other", QoS::ExactlyOnce, b"x".to_vec());
        exactly_once.pkid = 5;
        exactly_once.write(&mut out).unwrap();
        PingReq.write(&mut out).unwrap();
        client.write_all(&out).await.unwrap();

        let mut buffer = BytesMut::new();
        assert!(matches!(next(&mut client, &mut buffer).await, Packet::ConnAck(_)));
        assert!(matches!(next(&mut client, &mut buffer).await, Packet::SubAck(_)));
        assert_eq!(next(&mut client, &mut buffer).await, Packet::PubAck(PubAck::new(2)));
        match next(&mut client, &mut buffer).await {
            Packet::Publish(echo) => {
                assert_eq!(echo.topic, "sensors/1");
                assert_eq!(echo.qos, QoS::AtMostOnce);
                assert_eq!(&echo.payload[..], b"21.5");
            }
            other => panic!("expected echoed publish, got {other:?}"),
        }
        assert_eq!(next(&mut client, &mut buffer).await, Packet::PubRec(PubRec::new(5)));
        assert_eq!(next(&mut client, &mut buffer).await, Packet::PingResp);

        let mut out = BytesMut::new();
        rumqttc::mqttbytes::v4::PubRel::new(5).write(&mut out).unwrap();
        let mut unsubscribe = Unsubscribe::new("sensors/+");
        unsubscribe.pkid = 6;
        unsubscribe.write(&mut out).unwrap();
        Disconnect.write(&mut out).unwrap();
        client.write_all(&out).await.unwrap();

        assert_eq!(next(&mut client, &mut buffer).await, Packet::PubComp(PubComp::new(5)));
        assert_eq!(next(&mut client, &mut buffer).await, Packet::UnsubAck(UnsubAck::new(6)));
        assert!(read_packet(&mut client, &mut buffer).await.unwrap().is_none());

        let packets = log.lock().unwrap().clone();
        assert!(packets.contains(&BrokerPacket::Publish {
            topic: "sensors/1".to_string(),
            payload: b"21.5".to_vec(),
            qos: 1,
            retain: false,
        }));
        assert!(packets.contains(&BrokerPacket::Unsubscribe {
            filter: "sensors/+".to_string()
        }));
        assert_eq!(packets.last(), Some(&BrokerPacket::Disconnect));
    }

    #[tokio::test]
    async fn test_silent_broker_records_connect_without_answering() {
        let (mut client, log) = serve_in_background(Behaviour {
            rejected_filters: Vec::new(),
            silent: true,
        });

        let mut out = BytesMut::new();
        Connect::new("quiet").write(&mut out).unwrap();
        client.write_all(&out).await.unwrap();

        let mut buffer = BytesMut::new();
        let answer = tokio::time::timeout(
            Duration::from_millis(50),
            read_packet(&mut client, &mut buffer),
        )
        .await;
        assert!(answer.is_err());
        assert!(matches!(
            log.lock().unwrap().first(),
            Some(BrokerPacket::Connect { client_id, .. }) if client_id == "quiet"
        ));
    }

    #[tokio::test]
    async fn test_truncated_packet_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut out = BytesMut::new();
        Connect::new("cut").write(&mut out).unwrap();
        client.write_all(&out[..out.len() - 2]).await.unwrap();
        drop(client);

        let mut buffer = BytesMut::new();
        let error = read_packet(&mut server, &mut buffer).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
