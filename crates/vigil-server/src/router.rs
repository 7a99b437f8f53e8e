//! The dispatch loop: the single task that owns all mutable service state
//! and processes every decoded request in arrival order.
//!
//! Client checks degrade every internal failure to DENY — a checker never
//! learns why. Admin operations surface typed codes and observe the
//! corrupted-database latch. Mutations are staged on a clone of the store,
//! persisted, and only then committed, so a failed save leaves memory and
//! disk agreeing on the previous state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vigil_core::types::{MonitorEntry, Policy, PolicyKey, PolicyResult, PolicyType, Timestamp};
use vigil_core::{
    ApiCode, MonitorHub, OperationCode, PluginCheckOutcome, PluginRegistry, PluginUpdateOutcome,
    PolicyStore, StoreError, ROOT_BUCKET,
};
use vigil_protocol::{
    AdminRequest, AdminResponse, AgentAction, AgentRequest, AgentResponse, ClientRequest,
    ClientResponse, SignalRequest,
};
use vigil_storage::{Database, StorageError};

use crate::agents::AgentRegistry;
use crate::config::ServerConfig;
use crate::connection::{self, Channel, ConnId, ConnSender, Connection, ConnectionTable, Event};
use crate::listener;
use crate::pending::{PendingCheck, PendingRequests};

const SIGTERM: i32 = 15;

/// Run the daemon until SIGTERM.
///
/// Locks and loads the database (a corrupted load latches: checks DENY,
/// admin operations answer `DbCorrupted` until a restart finds a healthy
/// database), binds the listeners, then serves.
pub async fn run(config: ServerConfig, plugins: PluginRegistry) -> anyhow::Result<()> {
    let db = Database::open(&config.state_dir)?;
    let (store, db_corrupted) = match db.load() {
        Ok(store) => (store, false),
        Err(err @ StorageError::Corrupted { .. }) => {
            error!(error = %err, "database corrupted, all checks will deny");
            (PolicyStore::new(), true)
        }
        Err(err) => return Err(err.into()),
    };

    let listeners = listener::bind(&config)?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let conn_ids = Arc::new(AtomicU64::new(1));

    spawn_accept(listeners.client, Channel::Client, events_tx.clone(), Arc::clone(&conn_ids));
    spawn_accept(listeners.admin, Channel::Admin, events_tx.clone(), Arc::clone(&conn_ids));
    spawn_accept(listeners.agent, Channel::Agent, events_tx.clone(), Arc::clone(&conn_ids));
    spawn_signal_listener(events_tx);

    let mut service = Service::new(db, store, db_corrupted, plugins, config.monitor_capacity);
    info!("vigil daemon serving");

    while let Some(event) = events_rx.recv().await {
        if matches!(service.handle(event), Flow::Stop) {
            break;
        }
    }

    // Dropping the senders lets each writer flush its queue before the
    // sockets close; give those tasks a beat before the runtime goes away.
    service.connections.disconnect_all();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    info!("vigil daemon stopped");
    Ok(())
}

fn spawn_accept(
    listener: UnixListener,
    channel: Channel,
    events: mpsc::UnboundedSender<Event>,
    conn_ids: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = events.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn_id = conn_ids.fetch_add(1, Ordering::Relaxed);
                        debug!(conn_id, ?channel, "connection accepted");
                        match channel {
                            Channel::Client => connection::spawn(
                                conn_id,
                                channel,
                                stream,
                                events.clone(),
                                ConnSender::Client,
                                |conn_id, request| Event::Client { conn_id, request },
                            ),
                            Channel::Admin => connection::spawn(
                                conn_id,
                                channel,
                                stream,
                                events.clone(),
                                ConnSender::Admin,
                                |conn_id, request| Event::Admin { conn_id, request },
                            ),
                            Channel::Agent => connection::spawn(
                                conn_id,
                                channel,
                                stream,
                                events.clone(),
                                ConnSender::Agent,
                                |conn_id, request| Event::Agent { conn_id, request },
                            ),
                        }
                    }
                    Err(err) => {
                        warn!(?channel, error = %err, "accept failed");
                    }
                },
            }
        }
    });
}

#[cfg(unix)]
fn spawn_signal_listener(events: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let Ok(mut term) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            warn!("cannot install SIGTERM handler");
            return;
        };
        if term.recv().await.is_some() {
            let _ = events.send(Event::Signal(SignalRequest { signo: SIGTERM }));
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(_events: mpsc::UnboundedSender<Event>) {}

enum Flow {
    Continue,
    Stop,
}

/// All mutable daemon state, owned exclusively by the dispatch loop.
pub(crate) struct Service {
    db: Database,
    store: PolicyStore,
    db_corrupted: bool,
    plugins: PluginRegistry,
    pending: PendingRequests,
    agents: AgentRegistry,
    monitor: MonitorHub,
    /// Admin connections with an outstanding monitor-get, by request seq.
    monitor_waiters: HashMap<ConnId, u16>,
    pub(crate) connections: ConnectionTable,
}

impl Service {
    fn new(
        db: Database,
        store: PolicyStore,
        db_corrupted: bool,
        plugins: PluginRegistry,
        monitor_capacity: usize,
    ) -> Self {
        Self {
            db,
            store,
            db_corrupted,
            plugins,
            pending: PendingRequests::new(),
            agents: AgentRegistry::new(),
            monitor: MonitorHub::new(monitor_capacity),
            monitor_waiters: HashMap::new(),
            connections: ConnectionTable::new(),
        }
    }

    fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Connected {
                conn_id,
                channel,
                sender,
                token,
            } => {
                self.connections.insert(
                    conn_id,
                    Connection {
                        channel,
                        sender,
                        token,
                    },
                );
                Flow::Continue
            }
            Event::Client { conn_id, request } => {
                self.handle_client(conn_id, request);
                Flow::Continue
            }
            Event::Admin { conn_id, request } => {
                self.handle_admin(conn_id, request);
                Flow::Continue
            }
            Event::Agent { conn_id, request } => {
                self.handle_agent(conn_id, request);
                Flow::Continue
            }
            Event::Disconnected { conn_id } => {
                self.handle_disconnect(conn_id);
                Flow::Continue
            }
            Event::Signal(signal) => self.handle_signal(signal),
        }
    }

    fn handle_signal(&mut self, signal: SignalRequest) -> Flow {
        debug!(signo = signal.signo, "signal received");
        if signal.signo == SIGTERM {
            info!("SIGTERM received, stopping");
            return Flow::Stop;
        }
        Flow::Continue
    }

    // ── client channel ───────────────────────────────────────────────

    fn handle_client(&mut self, conn_id: ConnId, request: ClientRequest) {
        match request {
            ClientRequest::Check { seq, key } => self.handle_check(conn_id, seq, &key),
            ClientRequest::SimpleCheck { seq, key } => {
                self.handle_simple_check(conn_id, seq, &key);
            }
            ClientRequest::Cancel { seq } => self.handle_cancel(conn_id, seq),
            ClientRequest::MonitorEntriesPut { entries, .. } => {
                for entry in entries {
                    self.monitor.append(entry);
                }
                self.deliver_monitor_responses();
            }
        }
    }

    /// Evaluate against the store, degrading every failure to DENY.
    fn evaluate(&self, key: &PolicyKey) -> PolicyResult {
        if self.db_corrupted {
            return PolicyResult::deny();
        }
        self.store
            .check(ROOT_BUCKET, true, key)
            .unwrap_or_else(|err| {
                warn!(key = %key, error = %err, "evaluation failed, denying");
                PolicyResult::deny()
            })
    }

    fn handle_check(&mut self, conn_id: ConnId, seq: u16, key: &PolicyKey) {
        if self.pending.contains_client(conn_id, seq) {
            warn!(conn_id, seq, "check id already in flight, ignoring");
            return;
        }

        let raw = self.evaluate(key);
        match raw.policy_type() {
            PolicyType::ALLOW | PolicyType::DENY => self.finish_check(conn_id, seq, key, raw),
            _ => self.plugin_check(conn_id, seq, key, raw),
        }
    }

    /// Resolve a plugin-typed result, possibly suspending on an agent.
    fn plugin_check(&mut self, conn_id: ConnId, seq: u16, key: &PolicyKey, seed: PolicyResult) {
        let Ok(plugin) = self.plugins.get(seed.policy_type()) else {
            warn!(policy_type = %seed.policy_type(), "no plugin for policy type, denying");
            self.finish_check(conn_id, seq, key, PolicyResult::deny());
            return;
        };

        match plugin.check(key, &seed) {
            PluginCheckOutcome::Ready(result) => self.finish_check(conn_id, seq, key, result),
            PluginCheckOutcome::Error => {
                self.finish_check(conn_id, seq, key, PolicyResult::deny());
            }
            PluginCheckOutcome::AgentRequired {
                agent_type,
                payload,
            } => {
                let Some(agent_conn) = self.agents.agent_for(&agent_type) else {
                    debug!(agent_type = %agent_type, "no agent registered, denying");
                    self.finish_check(conn_id, seq, key, PolicyResult::deny());
                    return;
                };
                let pending = &self.pending;
                let Some(talker_seq) = self
                    .agents
                    .alloc_talker_seq(agent_conn, |candidate| {
                        pending.contains_talker(agent_conn, candidate)
                    })
                else {
                    warn!(agent_type = %agent_type, "agent talker ids exhausted, denying");
                    self.finish_check(conn_id, seq, key, PolicyResult::deny());
                    return;
                };

                let inserted = self.pending.insert(PendingCheck {
                    key: key.clone(),
                    client_conn: conn_id,
                    client_seq: seq,
                    agent_conn,
                    talker_seq,
                    plugin_type: seed.policy_type(),
                    cancelled: false,
                });
                if !inserted {
                    self.finish_check(conn_id, seq, key, PolicyResult::deny());
                    return;
                }

                debug!(conn_id, seq, agent_conn, talker_seq, "check suspended on agent");
                self.send_agent(
                    agent_conn,
                    AgentResponse::ActionPush {
                        seq: talker_seq,
                        action: AgentAction::Action,
                        payload,
                    },
                );
            }
        }
    }

    fn finish_check(&mut self, conn_id: ConnId, seq: u16, key: &PolicyKey, result: PolicyResult) {
        self.audit(key, result.policy_type());
        self.send_client(conn_id, ClientResponse::Check { seq, result });
    }

    fn handle_simple_check(&mut self, conn_id: ConnId, seq: u16, key: &PolicyKey) {
        let raw = self.evaluate(key);
        let mut code = ApiCode::Success;
        let result = match raw.policy_type() {
            PolicyType::ALLOW | PolicyType::DENY => raw,
            _ => match self.plugins.get(raw.policy_type()) {
                Err(_) => PolicyResult::deny(),
                Ok(plugin) => match plugin.check(key, &raw) {
                    PluginCheckOutcome::Ready(result) => result,
                    PluginCheckOutcome::AgentRequired { .. } => {
                        // Simple checks never suspend.
                        code = ApiCode::AccessNotResolved;
                        PolicyResult::deny()
                    }
                    PluginCheckOutcome::Error => PolicyResult::deny(),
                },
            },
        };

        self.audit(key, result.policy_type());
        self.send_client(
            conn_id,
            ClientResponse::SimpleCheck {
                seq,
                code: code.raw(),
                result,
            },
        );
    }

    fn handle_cancel(&mut self, conn_id: ConnId, seq: u16) {
        match self.pending.cancel(conn_id, seq) {
            None => {
                // Unknown id: nothing to answer, the client library reports
                // InvalidParam locally.
                debug!(conn_id, seq, "cancel for unknown request");
            }
            Some(before) if before.cancelled => {
                debug!(conn_id, seq, "cancel for already-cancelled request");
            }
            Some(before) => {
                self.send_agent(
                    before.agent_conn,
                    AgentResponse::ActionPush {
                        seq: before.talker_seq,
                        action: AgentAction::Cancel,
                        payload: String::new(),
                    },
                );
                self.send_client(conn_id, ClientResponse::Cancel { seq });
            }
        }
    }

    // ── agent channel ────────────────────────────────────────────────

    fn handle_agent(&mut self, conn_id: ConnId, request: AgentRequest) {
        match request {
            AgentRequest::Register { seq, agent_type } => {
                let code = self.agents.register(&agent_type, conn_id);
                self.send_agent(conn_id, AgentResponse::Register { seq, code });
            }
            AgentRequest::Action {
                seq,
                action,
                payload,
            } => self.handle_agent_action(conn_id, seq, action, &payload),
        }
    }

    fn handle_agent_action(
        &mut self,
        conn_id: ConnId,
        talker_seq: u16,
        action: AgentAction,
        payload: &str,
    ) {
        let Some(check) = self.pending.remove_by_talker(conn_id, talker_seq) else {
            // Unknown talker id is not a protocol violation; just log it.
            debug!(conn_id, talker_seq, "agent answer for unknown request, dropping");
            return;
        };

        if check.cancelled || action == AgentAction::Cancel {
            debug!(conn_id, talker_seq, "agent answer for cancelled request");
            return;
        }

        let result = match self.plugins.get(check.plugin_type) {
            Err(err) => {
                warn!(error = %err, "plugin vanished while awaiting agent, denying");
                PolicyResult::deny()
            }
            Ok(plugin) => match plugin.update(&check.key, payload) {
                PluginUpdateOutcome::Ready(result) => result,
                PluginUpdateOutcome::Error => PolicyResult::deny(),
            },
        };

        self.audit(&check.key, result.policy_type());
        self.send_client(
            check.client_conn,
            ClientResponse::Check {
                seq: check.client_seq,
                result,
            },
        );
    }

    // ── admin channel ────────────────────────────────────────────────

    fn handle_admin(&mut self, conn_id: ConnId, request: AdminRequest) {
        match request {
            AdminRequest::AdminCheck {
                seq,
                bucket,
                recursive,
                key,
            } => {
                let (result, bucket_valid) = if self.db_corrupted {
                    (PolicyResult::deny(), false)
                } else {
                    match self.store.check(&bucket, recursive, &key) {
                        Ok(result) => (result, true),
                        Err(err) => {
                            debug!(bucket = %bucket, error = %err, "admin check failed");
                            (PolicyResult::deny(), false)
                        }
                    }
                };
                self.send_admin(
                    conn_id,
                    AdminResponse::AdminCheck {
                        seq,
                        result,
                        bucket_valid,
                        db_corrupted: self.db_corrupted,
                    },
                );
            }

            AdminRequest::InsertOrUpdateBucket {
                seq,
                bucket,
                default,
            } => {
                self.mutate(conn_id, seq, move |store, plugins| {
                    if default.policy_type() != PolicyType::BUCKET
                        && !plugins.is_known_type(default.policy_type())
                    {
                        return Err(StoreError::UnknownPolicyType {
                            policy_type: default.policy_type(),
                        });
                    }
                    store.upsert_bucket(&bucket, default)
                });
            }

            AdminRequest::RemoveBucket { seq, bucket } => {
                self.mutate(conn_id, seq, move |store, _| store.delete_bucket(&bucket));
            }

            AdminRequest::SetPolicies { seq, insert, remove } => {
                self.mutate(conn_id, seq, move |store, plugins| {
                    let mut insert_batch: std::collections::BTreeMap<String, Vec<Policy>> =
                        std::collections::BTreeMap::new();
                    for (bucket, policies) in insert {
                        for policy in &policies {
                            let policy_type = policy.result.policy_type();
                            if !plugins.is_known_type(policy_type) {
                                return Err(StoreError::UnknownPolicyType { policy_type });
                            }
                        }
                        insert_batch.entry(bucket).or_default().extend(policies);
                    }
                    let mut remove_batch: std::collections::BTreeMap<String, Vec<PolicyKey>> =
                        std::collections::BTreeMap::new();
                    for (bucket, keys) in remove {
                        remove_batch.entry(bucket).or_default().extend(keys);
                    }
                    store.insert_policies(&insert_batch)?;
                    store.delete_policies(&remove_batch)
                });
            }

            AdminRequest::Erase {
                seq,
                start_bucket,
                recursive,
                filter,
            } => {
                self.mutate(conn_id, seq, move |store, _| {
                    store.erase(&start_bucket, recursive, &filter).map(|_| ())
                });
            }

            AdminRequest::List {
                seq,
                bucket,
                filter,
            } => {
                let (policies, bucket_valid) = if self.db_corrupted {
                    (Vec::new(), false)
                } else {
                    match self.store.list_policies(&bucket, &filter) {
                        Ok(policies) => (policies, true),
                        Err(_) => (Vec::new(), false),
                    }
                };
                self.send_admin(
                    conn_id,
                    AdminResponse::List {
                        seq,
                        policies,
                        bucket_valid,
                        db_corrupted: self.db_corrupted,
                    },
                );
            }

            AdminRequest::DescriptionList { seq } => {
                let descriptions = self.plugins.descriptions();
                self.send_admin(
                    conn_id,
                    AdminResponse::DescriptionList {
                        seq,
                        descriptions,
                        db_corrupted: self.db_corrupted,
                    },
                );
            }

            AdminRequest::MonitorGetEntries { seq, buffer_size } => {
                self.monitor.subscribe(conn_id, buffer_size as usize);
                self.monitor_waiters.insert(conn_id, seq);
                self.deliver_monitor_responses();
            }

            AdminRequest::MonitorGetFlush { seq } => {
                let reply_seq = self.monitor_waiters.remove(&conn_id).unwrap_or(seq);
                let entries = self.monitor.flush(conn_id).unwrap_or_default();
                self.send_admin(
                    conn_id,
                    AdminResponse::MonitorGetEntries {
                        seq: reply_seq,
                        entries,
                    },
                );
            }
        }
    }

    /// Apply one admin mutation: stage on a clone, persist, commit, then
    /// invalidate caches and drop checker connections. The success response
    /// is enqueued after the save so durability precedes visibility.
    fn mutate(
        &mut self,
        conn_id: ConnId,
        seq: u16,
        op: impl FnOnce(&mut PolicyStore, &PluginRegistry) -> Result<(), StoreError>,
    ) {
        let code = if self.db_corrupted {
            OperationCode::DbCorrupted
        } else {
            let mut staged = self.store.clone();
            match op(&mut staged, &self.plugins) {
                Err(err) => {
                    debug!(error = %err, "admin mutation rejected");
                    OperationCode::from(&err)
                }
                Ok(()) => match self.db.save(&staged) {
                    Err(err) => {
                        error!(error = %err, "persisting policy change failed, rolling back");
                        OperationCode::Failed
                    }
                    Ok(()) => {
                        self.store = staged;
                        OperationCode::Ok
                    }
                },
            }
        };

        self.send_admin(conn_id, AdminResponse::Code { seq, code });

        if code == OperationCode::Ok {
            self.on_policies_changed();
        }
    }

    /// Every cached decision in the fleet is now suspect: bump plugin
    /// generations and drop every checker connection.
    fn on_policies_changed(&mut self) {
        self.plugins.invalidate_all();
        self.connections.disconnect_checkers();
    }

    // ── monitor fan-out ──────────────────────────────────────────────

    fn audit(&mut self, key: &PolicyKey, decision: PolicyType) {
        if decision != PolicyType::ALLOW && decision != PolicyType::DENY {
            return;
        }
        self.monitor
            .append(MonitorEntry::new(key.clone(), decision, Timestamp::now()));
        self.deliver_monitor_responses();
    }

    fn deliver_monitor_responses(&mut self) {
        let ready: Vec<(ConnId, u16)> = self
            .monitor_waiters
            .iter()
            .filter(|(conn_id, _)| self.monitor.is_filled(**conn_id))
            .map(|(conn_id, seq)| (*conn_id, *seq))
            .collect();

        for (conn_id, seq) in ready {
            if let Some(entries) = self.monitor.fetch(conn_id, false) {
                self.monitor_waiters.remove(&conn_id);
                self.send_admin(conn_id, AdminResponse::MonitorGetEntries { seq, entries });
            }
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────

    fn handle_disconnect(&mut self, conn_id: ConnId) {
        debug!(conn_id, "connection closed");
        self.connections.remove(conn_id);

        // Checker side: agents get CANCEL for whatever was in flight; no
        // response is produced.
        for check in self.pending.cancel_for_client(conn_id) {
            self.send_agent(
                check.agent_conn,
                AgentResponse::ActionPush {
                    seq: check.talker_seq,
                    action: AgentAction::Cancel,
                    payload: String::new(),
                },
            );
        }

        // Monitor side.
        self.monitor_waiters.remove(&conn_id);
        self.monitor.unsubscribe(conn_id);

        // Agent side: every check waiting on this agent resolves DENY.
        if let Some(agent_type) = self.agents.unregister(conn_id) {
            info!(agent_type = %agent_type, conn_id, "agent disconnected");
            for check in self.pending.remove_for_agent(conn_id) {
                if !check.cancelled {
                    self.audit(&check.key, PolicyType::DENY);
                    self.send_client(
                        check.client_conn,
                        ClientResponse::Check {
                            seq: check.client_seq,
                            result: PolicyResult::deny(),
                        },
                    );
                }
            }
        }
    }

    // ── send helpers ─────────────────────────────────────────────────

    fn send_client(&self, conn_id: ConnId, response: ClientResponse) {
        if let Some(connection) = self.connections.get(conn_id) {
            connection.send_client(response);
        }
    }

    fn send_admin(&self, conn_id: ConnId, response: AdminResponse) {
        if let Some(connection) = self.connections.get(conn_id) {
            connection.send_admin(response);
        }
    }

    fn send_agent(&self, conn_id: ConnId, response: AgentResponse) {
        if let Some(connection) = self.connections.get(conn_id) {
            connection.send_agent(response);
        }
    }
}
