use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::order::{OrderError, OrderState, OrderTicket, TrackedOrder};
use crate::config::EngineConfig;
use crate::core::events::{IdempotencyKey, OrderRequest, OrderStatus};
use crate::monitoring::metrics::{self, MetricsCollector};
use crate::session::{ConnectionState, SessionHandle, SessionStatus};
use crate::transport::{Inbound, Outbound};

const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug)]
enum EngineCommand {
    Submit {
        request: OrderRequest,
        reply: oneshot::Sender<Result<OrderTicket, OrderError>>,
    },
    Cancel {
        key: IdempotencyKey,
        reply: oneshot::Sender<Result<OrderState, OrderError>>,
    },
    State {
        key: IdempotencyKey,
        reply: oneshot::Sender<Option<OrderState>>,
    },
    Orders {
        reply: oneshot::Sender<Vec<OrderState>>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct Draining {
    /// `None` when the grace is too long to schedule
    deadline: Option<Instant>,
    replies: Vec<oneshot::Sender<()>>,
}

/// Order execution engine
///
/// Runs as a single task that owns every order. Callers talk to it through
/// an `OrderEngineHandle`; the session feeds it order updates and connection
/// state.
pub struct OrderEngine {
    orders: HashMap<IdempotencyKey, TrackedOrder>,
    /// Terminal keys, oldest first
    retired: VecDeque<IdempotencyKey>,
    max_retained: usize,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    updates: mpsc::UnboundedReceiver<Inbound>,
    session: SessionHandle,
    status: watch::Receiver<SessionStatus>,
    settlement_grace: Duration,
    metrics: MetricsCollector,
    /// Last live generation observed, zero before the first
    generation: u64,
    connection: ConnectionState,
    draining: Option<Draining>,
}

impl OrderEngine {
    /// Spawn the engine task
    pub fn spawn(
        config: &EngineConfig,
        session: SessionHandle,
        updates: mpsc::UnboundedReceiver<Inbound>,
        metrics: MetricsCollector,
    ) -> (OrderEngineHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let engine = Self {
            orders: HashMap::new(),
            retired: VecDeque::new(),
            max_retained: config.max_retained_orders,
            commands,
            updates,
            status: session.watch_status(),
            session,
            settlement_grace: config.settlement_grace,
            metrics,
            generation: 0,
            connection: ConnectionState::Connecting,
            draining: None,
        };
        let handle = OrderEngineHandle {
            commands: command_tx,
            shutdown_grace: config.shutdown_grace,
        };
        (handle, tokio::spawn(engine.run()))
    }

    async fn run(mut self) {
        let mut updates_open = true;
        let mut status_open = true;
        let mut open_orders = 0;
        self.observe_status().await;

        loop {
            let deadline = self.next_deadline();
            let far_future = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.sync_status().await;
                        self.on_command(command).await
                    }
                    None => break,
                },
                update = self.updates.recv(), if updates_open => match update {
                    Some(update) => self.on_update(update),
                    None => updates_open = false,
                },
                changed = self.status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        self.on_session_closed();
                    } else {
                        self.observe_status().await;
                    }
                },
                _ = time::sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }

            let open = self.orders.values().filter(|o| !o.is_terminal()).count();
            if open != open_orders {
                open_orders = open;
                self.metrics.set_gauge(metrics::ORDERS_OPEN, open as f64).await;
            }

            if self.drained() {
                break;
            }
            self.evict_retired();
        }

        self.fail_open_orders(CONNECTION_LOST);
        if let Some(draining) = self.draining.take() {
            for reply in draining.replies {
                let _ = reply.send(());
            }
        }
        info!("Order engine stopped with {} tracked orders", self.orders.len());
    }

    /// Forget the oldest terminal orders beyond `max_retained`
    ///
    /// A forgotten key is accepted again as a new order.
    fn evict_retired(&mut self) {
        for (key, order) in self.orders.iter_mut() {
            if order.is_terminal() && !order.retired {
                order.retired = true;
                self.retired.push_back(key.clone());
            }
        }
        while self.retired.len() > self.max_retained {
            if let Some(key) = self.retired.pop_front() {
                debug!("Forgetting finished order {}", key);
                self.orders.remove(&key);
            }
        }
    }

    fn drained(&self) -> bool {
        self.draining.is_some() && self.orders.values().all(|order| order.is_terminal())
    }

    async fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit { request, reply } => {
                let result = self.submit(request).await;
                let _ = reply.send(result);
            }
            EngineCommand::Cancel { key, reply } => {
                let result = self.cancel(&key);
                let _ = reply.send(result);
            }
            EngineCommand::State { key, reply } => {
                let _ = reply.send(self.orders.get(&key).map(|o| o.state().clone()));
            }
            EngineCommand::Orders { reply } => {
                let mut states: Vec<_> = self.orders.values().map(|o| o.state().clone()).collect();
                states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let _ = reply.send(states);
            }
            EngineCommand::Shutdown { grace, reply } => match &mut self.draining {
                Some(draining) => draining.replies.push(reply),
                None => {
                    info!("Order engine draining for up to {:?}", grace);
                    self.draining = Some(Draining {
                        deadline: Instant::now().checked_add(grace),
                        replies: vec![reply],
                    });
                }
            },
        }
    }

    async fn submit(&mut self, request: OrderRequest) -> Result<OrderTicket, OrderError> {
        if self.draining.is_some() {
            return Err(OrderError::EngineStopped);
        }
        if self.connection.is_closed() {
            return Err(OrderError::ConnectionLost);
        }

        if let Some(existing) = self.orders.get(&request.key) {
            if existing.is_terminal() {
                return Err(OrderError::AlreadyTerminal {
                    key: request.key,
                    status: existing.status(),
                });
            }
            debug!("Order {} already in flight, not resubmitting", request.key);
            return Ok(existing.ticket());
        }

        request.validate().map_err(OrderError::InvalidRequest)?;

        let key = request.key.clone();
        info!(
            "Accepted order {}: {} {} {} for {:?}",
            key, request.direction, request.amount, request.asset, request.expiry
        );
        let order = TrackedOrder::new(request, Instant::now());
        let ticket = order.ticket();
        self.orders.insert(key.clone(), order);

        if self.connection.is_live() {
            self.send_open(&key, self.generation).await;
        }
        Ok(ticket)
    }

    fn cancel(&mut self, key: &IdempotencyKey) -> Result<OrderState, OrderError> {
        let live = self.connection.is_live();
        let generation = self.generation;
        let order = self
            .orders
            .get_mut(key)
            .ok_or_else(|| OrderError::UnknownOrder(key.clone()))?;

        if order.is_terminal() {
            return Err(OrderError::AlreadyTerminal {
                key: key.clone(),
                status: order.status(),
            });
        }

        if order.status() == OrderStatus::Pending && order.state().sends == 0 {
            order.finish(OrderStatus::Cancelled, "cancelled before submission");
            info!("Order {} cancelled locally", key);
            return Ok(order.state().clone());
        }

        order.cancel_requested = true;
        if live && order.cancel_generation != Some(generation) {
            queue_cancel(&self.session, order, generation);
        }
        Ok(order.state().clone())
    }

    fn on_update(&mut self, update: Inbound) {
        let key = match &update {
            Inbound::OrderAck { key, .. }
            | Inbound::OrderFilled { key, .. }
            | Inbound::OrderRejected { key, .. }
            | Inbound::OrderCancelled { key } => key.clone(),
            _ => return,
        };
        let Some(order) = self.orders.get_mut(&key) else {
            warn!("Update for unknown order {}", key);
            return;
        };
        if order.is_terminal() {
            debug!("Late update for {} order {}", order.status(), key);
            return;
        }

        match update {
            Inbound::OrderAck { order_id, .. } => {
                order.transition_with(OrderStatus::Acknowledged, |state| {
                    state.order_id = order_id;
                });
            }
            Inbound::OrderFilled { payout, .. } => {
                // a fill implies the broker accepted the order
                if order.status() != OrderStatus::Acknowledged {
                    order.transition(OrderStatus::Acknowledged);
                }
                if order.transition_with(OrderStatus::Filled, |state| state.payout = payout) {
                    info!("Order {} filled", key);
                }
            }
            Inbound::OrderRejected { reason, .. } => {
                warn!("Order {} rejected: {}", key, reason);
                order.finish(OrderStatus::Rejected, reason);
            }
            Inbound::OrderCancelled { .. } => {
                info!("Order {} cancelled by broker", key);
                order.finish(OrderStatus::Cancelled, "cancelled by broker");
            }
            _ => {}
        }
    }

    /// Apply a pending status change before serving a caller
    async fn sync_status(&mut self) {
        if self.status.has_changed().unwrap_or(false) {
            self.observe_status().await;
        }
    }

    async fn observe_status(&mut self) {
        let (state, generation) = {
            let status = self.status.borrow_and_update();
            (status.state, status.generation)
        };

        match state {
            ConnectionState::Live if generation != self.generation => {
                if self.generation != 0 {
                    // the degraded step may have been coalesced away
                    self.rewind_unacknowledged();
                }
                self.generation = generation;
                self.connection = ConnectionState::Live;
                self.send_outstanding().await;
            }
            ConnectionState::Live => self.connection = ConnectionState::Live,
            ConnectionState::Degraded => {
                if self.connection.is_live() {
                    self.rewind_unacknowledged();
                }
                self.connection = ConnectionState::Degraded;
            }
            ConnectionState::Connecting => {}
            ConnectionState::Closed => self.on_session_closed(),
        }
    }

    /// Orders on the wire without an ack must be resent on the next connection
    fn rewind_unacknowledged(&mut self) {
        for order in self.orders.values_mut() {
            if order.status() == OrderStatus::Submitted {
                order.transition(OrderStatus::Pending);
            }
        }
    }

    /// Send every order not yet on the wire for the current generation, oldest first
    async fn send_outstanding(&mut self) {
        let generation = self.generation;
        let mut keys: Vec<_> = self
            .orders
            .values()
            .filter(|order| !order.is_terminal())
            .map(|order| (order.state().created_at, order.state().key.clone()))
            .collect();
        keys.sort();

        for (_, key) in keys {
            let Some(order) = self.orders.get_mut(&key) else {
                continue;
            };
            if order.cancel_requested {
                if order.cancel_generation != Some(generation) {
                    queue_cancel(&self.session, order, generation);
                }
            } else if order.status() == OrderStatus::Pending
                && order.sent_generation != Some(generation)
            {
                self.send_open(&key, generation).await;
            }
        }
    }

    async fn send_open(&mut self, key: &IdempotencyKey, generation: u64) {
        let Some(order) = self.orders.get_mut(key) else {
            return;
        };
        let frame = match Outbound::open_order(&order.state().request).encode() {
            Ok(frame) => frame,
            Err(e) => {
                order.finish(OrderStatus::Failed, e.to_string());
                return;
            }
        };
        if let Err(e) = self.session.queue(generation, frame) {
            debug!("Order {} stays pending: {}", key, e);
            return;
        }

        let resent = order.record_send(generation);
        order.transition(OrderStatus::Submitted);
        self.metrics.increment_counter(metrics::ORDERS_SENT, 1).await;
        if resent {
            info!("Resent order {} on generation {}", key, generation);
            self.metrics.increment_counter(metrics::ORDERS_RESENT, 1).await;
        } else {
            debug!("Sent order {} on generation {}", key, generation);
        }
    }

    fn on_session_closed(&mut self) {
        if self.connection.is_closed() {
            return;
        }
        warn!("Session closed, failing in-flight orders");
        self.connection = ConnectionState::Closed;
        self.fail_open_orders(CONNECTION_LOST);
    }

    fn fail_open_orders(&mut self, reason: &str) {
        for order in self.orders.values_mut() {
            if !order.is_terminal() {
                order.finish(OrderStatus::Failed, reason);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let orders = self
            .orders
            .values()
            .filter(|order| !order.is_terminal())
            .filter_map(|order| order.deadline(self.settlement_grace));
        let draining = self.draining.as_ref().and_then(|d| d.deadline);
        orders.chain(draining).min()
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        let grace = self.settlement_grace;
        let mut expired = 0;

        for order in self.orders.values_mut() {
            if order.is_terminal() || !order.deadline(grace).is_some_and(|d| d <= now) {
                continue;
            }
            let reason = if order.status() == OrderStatus::Acknowledged {
                "no result within settlement grace"
            } else {
                "not acknowledged before expiry"
            };
            if order.finish(OrderStatus::Expired, reason) {
                warn!("Order {} expired: {}", order.state().key, reason);
                expired += 1;
            }
        }
        if expired > 0 {
            self.metrics
                .increment_counter(metrics::ORDERS_EXPIRED, expired)
                .await;
        }

        if self
            .draining
            .as_ref()
            .and_then(|d| d.deadline)
            .is_some_and(|deadline| deadline <= now)
        {
            warn!("Shutdown grace elapsed, failing remaining orders");
            self.fail_open_orders(CONNECTION_LOST);
        }
    }
}

fn queue_cancel(session: &SessionHandle, order: &mut TrackedOrder, generation: u64) {
    let message = Outbound::CancelOrder {
        key: order.state().key.clone(),
    };
    match message.encode() {
        Ok(frame) => match session.queue(generation, frame) {
            Ok(()) => {
                order.cancel_generation = Some(generation);
                info!("Cancel requested for order {}", order.state().key);
            }
            Err(e) => debug!("Cancel for {} not queued: {}", order.state().key, e),
        },
        Err(e) => warn!("Could not encode cancel for {}: {}", order.state().key, e),
    }
}

/// Cloneable handle to the order engine task
#[derive(Debug, Clone)]
pub struct OrderEngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    shutdown_grace: Duration,
}

impl OrderEngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, OrderError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| OrderError::EngineStopped)?;
        response.await.map_err(|_| OrderError::EngineStopped)
    }

    /// Accept an order and return immediately with its ticket
    pub async fn place(&self, request: OrderRequest) -> Result<OrderTicket, OrderError> {
        self.request(|reply| EngineCommand::Submit { request, reply })
            .await?
    }

    /// Accept an order and wait for its terminal state
    pub async fn submit(&self, request: OrderRequest) -> Result<OrderState, OrderError> {
        let mut ticket = self.place(request).await?;
        Ok(ticket.wait().await)
    }

    pub async fn cancel(&self, key: impl Into<IdempotencyKey>) -> Result<OrderState, OrderError> {
        let key = key.into();
        self.request(|reply| EngineCommand::Cancel { key, reply })
            .await?
    }

    pub async fn state(&self, key: impl Into<IdempotencyKey>) -> Result<Option<OrderState>, OrderError> {
        let key = key.into();
        self.request(|reply| EngineCommand::State { key, reply }).await
    }

    /// Every tracked order, oldest first
    pub async fn orders(&self) -> Result<Vec<OrderState>, OrderError> {
        self.request(|reply| EngineCommand::Orders { reply }).await
    }

    /// Stop accepting work and wait up to the configured grace for in-flight orders
    pub async fn shutdown(&self) {
        self.shutdown_within(self.shutdown_grace).await
    }

    pub async fn shutdown_within(&self, grace: Duration) {
        let _ = self
            .request(|reply| EngineCommand::Shutdown { grace, reply })
            .await;
    }
}
