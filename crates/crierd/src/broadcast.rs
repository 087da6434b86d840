use std::time::Instant;

use chrono::Utc;
use crier_common::protocol::{BroadcastRecord, ErrorKind, ServerMsg};
use crier_common::validate::{validate_notice, Notice};
use tracing::debug;
use uuid::Uuid;

use crate::engine::Engine;
use crate::metrics::{counters, histograms};
use crate::session::{Outbound, SessionId};

impl Engine {
    /// Validate and fan out a broadcaster-submitted notice.
    ///
    /// Every authenticated session other than the sender whose filter
    /// admits the notice's lowercased source gets exactly one copy. A slow
    /// receiver with a full queue is skipped, never waited on.
    pub(crate) fn handle_broadcast(&mut self, id: SessionId, payload: &serde_json::Value) {
        let Some(session) = self.registry.find(id) else {
            return;
        };
        if !session.authenticated {
            self.send_error(id, ErrorKind::Auth, "not authenticated");
            return;
        }
        if !session.is_broadcaster {
            self.send_error(id, ErrorKind::Permission, "broadcaster rights required");
            return;
        }
        let sender = session.username.clone().unwrap_or_default();

        let notice = match validate_notice(payload) {
            Ok(notice) => notice,
            Err(e) => {
                self.send_error(id, ErrorKind::Validation, e.to_string());
                return;
            }
        };

        let broadcast_id = Uuid::now_v7().to_string();
        let start = Instant::now();
        let recipients = self.fan_out(id, &broadcast_id, &sender, &notice);
        histograms::broadcast_fanout_seconds(start.elapsed().as_secs_f64());

        self.counters.total_broadcasts += 1;
        self.counters.messages_delivered += recipients as u64;
        counters::broadcasts_total();
        counters::messages_delivered_total(recipients as u64);

        self.recent.push(BroadcastRecord {
            id: broadcast_id.clone(),
            title: notice.title.clone(),
            source: notice.source.clone(),
            sender: sender.clone(),
            recipients,
            timestamp: Utc::now(),
        });

        self.send_to(
            id,
            ServerMsg::BroadcastSent {
                id: broadcast_id,
                recipients,
            },
        );
        debug!(
            sender = %sender,
            source = %notice.source,
            recipients,
            "broadcast dispatched"
        );
    }

    fn fan_out(
        &mut self,
        sender_id: SessionId,
        broadcast_id: &str,
        sender: &str,
        notice: &Notice,
    ) -> usize {
        let key = notice.source_key();
        let timestamp = Utc::now();
        let mut recipients = 0;

        for session in self.registry.iter_mut() {
            if session.id == sender_id || !session.authenticated {
                continue;
            }
            if !session.filters.matches(&key) {
                continue;
            }
            let envelope = ServerMsg::Broadcast {
                id: broadcast_id.to_string(),
                title: notice.title.clone(),
                url: notice.url.clone(),
                icon: notice.icon.clone(),
                source: notice.source.clone(),
                image: notice.image.clone(),
                sender: sender.to_string(),
                timestamp,
            };
            if session.handle.send(Outbound::Envelope(envelope)) {
                session.messages_received += 1;
                recipients += 1;
            }
        }
        recipients
    }
}
