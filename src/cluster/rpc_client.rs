//! Outbound broker access: request/reply calls, fire-and-forget sends,
//! and the targeted per-user push/kick publishes.

use super::discovery::Server;
use super::subjects;
use super::Error;
use crate::broker::{Broker, BrokerError};
use crate::protocol::{self, BindMsg, KickMsg, Push, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RpcClient {
    broker: Arc<dyn Broker>,
    server: Arc<Server>,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, server: Arc<Server>, request_timeout: Duration) -> Self {
        Self {
            broker,
            server,
            request_timeout,
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Request/reply to a specific server instance.
    pub async fn call(&self, target: &Server, request: &Request) -> Result<Response, Error> {
        let subject = subjects::server_subject(&target.server_type, &target.id);
        let payload = protocol::encode(request)?;
        let bytes = self
            .broker
            .request(&subject, payload, self.request_timeout)
            .await
            .map_err(|err| match err {
                BrokerError::RequestTimeout => Error::Timeout,
                other => Error::Broker(other),
            })?;
        Ok(protocol::decode(&bytes)?)
    }

    /// Fire-and-forget send of an encoded request envelope.
    pub async fn send(&self, subject: &str, request: &Request) -> Result<(), Error> {
        self.broker
            .publish(subject, protocol::encode(request)?)
            .await?;
        Ok(())
    }

    /// Announce a frontend bind on this server type's bindings subject.
    /// Peers of the same type consume this to refresh their local caches.
    pub async fn broadcast_session_bind(&self, uid: &str) -> Result<(), Error> {
        let msg = BindMsg {
            uid: uid.to_string(),
            fid: self.server.id.clone(),
            sid: 0,
            metadata: HashMap::new(),
        };
        self.broker
            .publish(
                &subjects::bindings_subject(&self.server.server_type),
                protocol::encode(&msg)?,
            )
            .await?;
        Ok(())
    }

    /// Publish a per-user message on the owning frontend's push subject.
    pub async fn send_push(
        &self,
        uid: &str,
        frontend_type: &str,
        push: &Push,
    ) -> Result<(), Error> {
        self.broker
            .publish(
                &subjects::user_messages_subject(uid, frontend_type),
                protocol::encode(push)?,
            )
            .await?;
        Ok(())
    }

    /// Publish a kick on the owning frontend's kick subject.
    pub async fn send_kick(
        &self,
        uid: &str,
        frontend_type: &str,
        kick: &KickMsg,
    ) -> Result<(), Error> {
        self.broker
            .publish(
                &subjects::user_kick_subject(uid, frontend_type),
                protocol::encode(kick)?,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::BrokerMessage;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn client(broker: MemoryBroker) -> RpcClient {
        RpcClient::new(
            Arc::new(broker),
            Server::frontend("f1", "connector"),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn call_resolves_unicast_subject_and_decodes_reply() {
        let broker = MemoryBroker::new();
        let peer = broker.client();
        let (tx, mut rx) = mpsc::channel::<BrokerMessage>(4);
        peer.subscribe("pitaya/servers/room/r1", None, tx)
            .await
            .unwrap();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let req: Request = protocol::decode(&msg.payload).unwrap();
            assert_eq!(req.msg.route, "room.join");
            let reply = protocol::encode(&Response::ack()).unwrap();
            peer.publish(&msg.reply.unwrap(), reply).await.unwrap();
        });

        let client = client(broker);
        let target = Server::backend("r1", "room");
        let request = Request::new(protocol::Message::request("room.join", vec![]));
        let response = client.call(&target, &request).await.unwrap();
        assert_eq!(response.data, protocol::ACK);
    }

    #[tokio::test]
    async fn call_times_out_without_reply() {
        let broker = MemoryBroker::new();
        let peer = broker.client();
        let (tx, _rx) = mpsc::channel::<BrokerMessage>(4);
        peer.subscribe("pitaya/servers/room/r1", None, tx)
            .await
            .unwrap();

        let client = client(broker);
        let target = Server::backend("r1", "room");
        let request = Request::new(protocol::Message::request("room.join", vec![]));
        let err = client.call(&target, &request).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn broadcast_lands_on_bindings_subject() {
        let broker = MemoryBroker::new();
        let peer = broker.client();
        let (tx, mut rx) = mpsc::channel::<BrokerMessage>(4);
        peer.subscribe("pitaya/connector/bindings", None, tx)
            .await
            .unwrap();

        client(broker).broadcast_session_bind("u1").await.unwrap();
        let msg = rx.recv().await.unwrap();
        let bind: BindMsg = protocol::decode(&msg.payload).unwrap();
        assert_eq!(bind.uid, "u1");
        assert_eq!(bind.fid, "f1");
    }

    #[tokio::test]
    async fn push_targets_the_user_subject() {
        let broker = MemoryBroker::new();
        let peer = broker.client();
        let (tx, mut rx) = mpsc::channel::<BrokerMessage>(4);
        peer.subscribe("pitaya/connector/user/u1/push", None, tx)
            .await
            .unwrap();

        let push = Push {
            route: "chat.message".into(),
            uid: "u1".into(),
            data: Bytes::from_static(b"hey").to_vec(),
        };
        client(broker)
            .send_push("u1", "connector", &push)
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        let decoded: Push = protocol::decode(&msg.payload).unwrap();
        assert_eq!(decoded.route, "chat.message");
    }
}
