//! Client-facing request handler.
//!
//! Reply loop for the eight services, wired to the broker. Per inbound
//! frame: merge the sender's Lamport clock, apply the operation under the
//! state lock, stamp the reply with a fresh tick, then do the slow work
//! (persistence, publication, sync scheduling) outside the lock.

use std::net::TcpStream;
use std::sync::Arc;

use crate::record::MessageRecord;
use crate::state::OpError;
use crate::wire::frame::{FrameReader, FrameWriter};
use crate::wire::proto::{
    decode_client_request, encode_reply, ClientRequest, Meta, ProtoDecodeError, Publication,
    Reply, ReplyBody, Status,
};

use super::election::ElectionManager;
use super::publisher::PublisherHandle;
use super::{lock, replication, Shared};

pub fn handle_connection(
    stream: TcpStream,
    shared: &Arc<Shared>,
    publisher: &PublisherHandle,
    election: &Arc<ElectionManager>,
) {
    let mut reader = FrameReader::new(&stream);
    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!("client connection dropped: {err}");
                return;
            }
        };

        let reply = match decode_client_request(&frame) {
            Ok((request, meta)) => {
                shared.observe(meta.clock);
                handle_request(shared, publisher, election, request)
            }
            Err(ProtoDecodeError::UnknownService(service)) => {
                Reply::new(service.clone(), Status::Erro, shared.stamp())
                    .with_description(format!("Serviço desconhecido: {service}"))
            }
            Err(err) => {
                tracing::debug!("malformed client frame: {err}");
                Reply::new("error", Status::Erro, shared.stamp())
                    .with_description("Mensagem inválida")
            }
        };

        let Ok(payload) = encode_reply(&reply) else {
            return;
        };
        if FrameWriter::new(&stream).write_frame(&payload).is_err() {
            return;
        }
    }
}

fn handle_request(
    shared: &Arc<Shared>,
    publisher: &PublisherHandle,
    election: &Arc<ElectionManager>,
    request: ClientRequest,
) -> Reply {
    let service = request.service();
    match request {
        ClientRequest::Login { user } => {
            let (result, meta, due) = {
                let mut state = lock(&shared.state);
                match state.login(&user) {
                    Ok(record) => {
                        let due = state.bump_processed(shared.config.sync_interval);
                        (Ok(record), state.stamp(), due)
                    }
                    Err(err) => (Err(err), state.stamp(), false),
                }
            };
            match result {
                Ok(record) => {
                    tracing::info!(user = %record.user, "new login");
                    if let Err(err) = shared.store.append_login(&record) {
                        tracing::warn!("login not persisted: {err}");
                    }
                    after_mutation(shared, election, due);
                    Reply::new(service, Status::Sucesso, meta)
                }
                Err(err) => failure(service, err, meta),
            }
        }

        ClientRequest::Users => {
            let (users, meta) = {
                let mut state = lock(&shared.state);
                (state.users(), state.stamp())
            };
            Reply::new(service, Status::Sucesso, meta).with_body(ReplyBody::Users(users))
        }

        ClientRequest::Channel { channel } => {
            let (result, meta, due) = {
                let mut state = lock(&shared.state);
                match state.create_channel(&channel) {
                    Ok(record) => {
                        let due = state.bump_processed(shared.config.sync_interval);
                        (Ok(record), state.stamp(), due)
                    }
                    Err(err) => (Err(err), state.stamp(), false),
                }
            };
            match result {
                Ok(record) => {
                    tracing::info!(channel = %record.channel, "new channel");
                    if let Err(err) = shared.store.append_channel(&record) {
                        tracing::warn!("channel not persisted: {err}");
                    }
                    publisher.publish(Publication::NewChannel {
                        channel: record.channel.clone(),
                        timestamp: record.timestamp,
                        clock: record.clock,
                    });
                    after_mutation(shared, election, due);
                    Reply::new(service, Status::Sucesso, meta)
                }
                Err(err) => failure(service, err, meta),
            }
        }

        ClientRequest::Channels => {
            let (channels, meta) = {
                let mut state = lock(&shared.state);
                (state.channels(), state.stamp())
            };
            Reply::new(service, Status::Sucesso, meta).with_body(ReplyBody::Channels(channels))
        }

        ClientRequest::Publish {
            user,
            channel,
            message,
        } => {
            let (result, meta, due) = {
                let mut state = lock(&shared.state);
                match state.publish(&user, &channel, &message) {
                    Ok(record) => {
                        let due = state.bump_processed(shared.config.sync_interval);
                        let messages = state.messages();
                        (Ok((record, messages)), state.stamp(), due)
                    }
                    Err(err) => (Err(err), state.stamp(), false),
                }
            };
            match result {
                Ok((record, messages)) => {
                    tracing::info!(channel = %channel, user = %user, "publication");
                    persist_messages(shared, &messages);
                    publisher.publish(Publication::Record(record));
                    after_mutation(shared, election, due);
                    Reply::new(service, Status::Ok, meta)
                }
                Err(err) => failure(service, err, meta),
            }
        }

        ClientRequest::Message { src, dst, message } => {
            let (result, meta, due) = {
                let mut state = lock(&shared.state);
                match state.private_message(&src, &dst, &message) {
                    Ok(record) => {
                        let due = state.bump_processed(shared.config.sync_interval);
                        let messages = state.messages();
                        (Ok((record, messages)), state.stamp(), due)
                    }
                    Err(err) => (Err(err), state.stamp(), false),
                }
            };
            match result {
                Ok((record, messages)) => {
                    tracing::info!(src = %src, dst = %dst, "private message");
                    persist_messages(shared, &messages);
                    publisher.publish(Publication::Record(record));
                    after_mutation(shared, election, due);
                    Reply::new(service, Status::Ok, meta)
                }
                Err(err) => failure(service, err, meta),
            }
        }

        ClientRequest::GetHistory { channel, limit } => {
            let (result, meta) = {
                let mut state = lock(&shared.state);
                (state.history(&channel, limit), state.stamp())
            };
            match result {
                Ok(messages) => {
                    tracing::debug!(channel = %channel, records = messages.len(), "history served");
                    Reply::new(service, Status::Sucesso, meta)
                        .with_body(ReplyBody::Messages(messages))
                }
                Err(err) => failure(service, err, meta),
            }
        }

        ClientRequest::GetPrivateHistory { user, peer, limit } => {
            let (result, meta) = {
                let mut state = lock(&shared.state);
                (state.private_history(&user, &peer, limit), state.stamp())
            };
            match result {
                Ok(messages) => {
                    tracing::debug!(user = %user, records = messages.len(), "private history served");
                    Reply::new(service, Status::Sucesso, meta)
                        .with_body(ReplyBody::Messages(messages))
                }
                Err(err) => failure(service, err, meta),
            }
        }
    }
}

fn failure(service: &'static str, err: OpError, meta: Meta) -> Reply {
    Reply::new(service, Status::Erro, meta).with_description(err.to_string())
}

fn persist_messages(shared: &Arc<Shared>, messages: &[MessageRecord]) {
    if let Err(err) = shared.store.save_messages(messages) {
        tracing::warn!("messages not persisted: {err}");
    }
}

fn after_mutation(shared: &Arc<Shared>, election: &Arc<ElectionManager>, sync_due: bool) {
    if sync_due {
        let processed = lock(&shared.state).processed();
        tracing::info!(processed, "sync round scheduled");
        replication::run_sync_round(shared, election);
    }
}
