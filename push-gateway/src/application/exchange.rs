//! # 交换器
//!
//! 唯一的协调者：后端推送经由这里找到用户连接，连接状态变化经由这里
//! 变成发往各 acceptor 的同步消息。其他组件之间不直接依赖。
//!
//! 投递失败从不向触发方返回错误，只记录指标与失败时间，由对账任务补偿。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result, current_millis};

use crate::config::GatewayConfig;
use crate::domain::model::{Action, ActionKind, PublicMessage, UserSnapshot};
use crate::domain::service::{GrayList, SyncSource, filter_entry, split_batches};
use crate::infrastructure::acceptor::{Acceptor, AcceptorMgr};
use crate::infrastructure::public::PublicMgr;
use crate::infrastructure::session::session::wait_stopped;
use crate::infrastructure::session::{Session, SessionListener, SessionMgr};
use crate::infrastructure::user::{User, UserMgr};
use crate::proto::{BackendFrame, ConfigPayload, InputMessage, PushMessage, SyncPayload, UserSync};

use super::event::{Event, SyncUsers};

pub struct Exchange {
    config: Arc<GatewayConfig>,
    users: Arc<UserMgr>,
    acceptors: Arc<AcceptorMgr>,
    publics: Arc<PublicMgr>,
    sessions: Arc<SessionMgr>,
    gray: GrayList,
    event_tx: mpsc::Sender<Event>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    /// 最近一次事件入队失败的时间（毫秒）
    last_fail_ms: AtomicI64,
    /// 上次全量重同步后是否又有事件被丢弃
    resync_pending: AtomicBool,
    force_sync_last: DashMap<i64, i64>,
    sync_seq: AtomicU64,
    metrics: Arc<GatewayMetrics>,
}

impl Exchange {
    pub fn new(
        config: Arc<GatewayConfig>,
        users: Arc<UserMgr>,
        acceptors: Arc<AcceptorMgr>,
        publics: Arc<PublicMgr>,
        sessions: Arc<SessionMgr>,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_size.max(1));
        let gray = GrayList::new(config.gray_uids.iter().copied());
        Arc::new(Self {
            config,
            users,
            acceptors,
            publics,
            sessions,
            gray,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            last_fail_ms: AtomicI64::new(0),
            resync_pending: AtomicBool::new(false),
            force_sync_last: DashMap::new(),
            sync_seq: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn last_fail_ms(&self) -> i64 {
        self.last_fail_ms.load(Ordering::Acquire)
    }

    pub fn needs_resync(&self) -> bool {
        self.resync_pending.load(Ordering::Acquire)
    }

    /// 取走丢弃标记，返回取走前是否置位
    pub fn take_resync_pending(&self) -> bool {
        self.resync_pending.swap(false, Ordering::AcqRel)
    }

    /// 清理已过节流间隔的强制同步记录，返回剩余条目数
    pub fn prune_force_sync(&self, now_ms: i64) -> usize {
        let interval = self.config.force_sync_interval.as_millis() as i64;
        self.force_sync_last.retain(|_, last| now_ms - *last < interval);
        self.force_sync_last.len()
    }

    pub fn gray(&self) -> &GrayList {
        &self.gray
    }

    pub fn users(&self) -> &Arc<UserMgr> {
        &self.users
    }

    pub fn acceptors(&self) -> &Arc<AcceptorMgr> {
        &self.acceptors
    }

    pub fn publics(&self) -> &Arc<PublicMgr> {
        &self.publics
    }

    pub fn sessions(&self) -> &Arc<SessionMgr> {
        &self.sessions
    }

    // ---------------------------------------------------------------------
    // 后端 → 客户端
    // ---------------------------------------------------------------------

    /// 处理 acceptor 发来的一批推送
    pub fn on_message(&self, acceptor: &Arc<Acceptor>, messages: Vec<PushMessage>) {
        for msg in messages {
            if msg.is_public() {
                let kind = msg.message_kind();
                let public = PublicMessage::new(msg.topic, kind, msg.payload)
                    .with_source(acceptor.app_id(), acceptor.id());
                if let Err(e) = self.publics.write(public) {
                    debug!(acceptor_id = %acceptor.id(), error = %e, "public message dropped");
                }
                continue;
            }
            self.route_private(acceptor, msg);
        }
    }

    fn route_private(&self, acceptor: &Arc<Acceptor>, msg: PushMessage) {
        let Some(user) = self.users.get(msg.uid) else {
            self.request_force_sync(msg.uid, Some(acceptor.id()));
            return;
        };

        let mut matched = 0usize;
        for session in user.sessions().iter() {
            if !msg.session_id.is_empty() && session.id() != msg.session_id {
                continue;
            }
            if !msg.pass_through && !session.client().topics().contains(&msg.topic) {
                continue;
            }
            matched += 1;
            if let Err(e) = session.write_push(msg.payload.clone()) {
                debug!(uid = msg.uid, session_id = %session.id(), error = %e, "push not delivered");
            }
        }

        if matched == 0 {
            self.request_force_sync(msg.uid, Some(acceptor.id()));
        }
    }

    /// 同一 uid 在节流间隔内只发起一次强制同步
    fn request_force_sync(&self, uid: i64, acceptor_id: Option<&str>) {
        let now = current_millis();
        let interval = self.config.force_sync_interval.as_millis() as i64;
        let mut throttled = false;
        self.force_sync_last
            .entry(uid)
            .and_modify(|last| {
                if now - *last < interval {
                    throttled = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        if throttled {
            return;
        }

        self.metrics.force_sync_total.inc();
        debug!(uid, acceptor_id = ?acceptor_id, "push without target, forcing user sync");
        self.dispatch_event(Event::ForceSyncUser {
            uid,
            acceptor_id: acceptor_id.map(str::to_string),
        });
    }

    // ---------------------------------------------------------------------
    // 客户端 → 后端
    // ---------------------------------------------------------------------

    /// 登录成功后绑定用户并通知后端上线
    pub fn on_login(&self, session: &Arc<Session>, uid: i64, api_key: Option<String>) -> Result<()> {
        let current = session.member_id();
        if current == uid {
            return Ok(());
        }
        if current != 0 {
            return Err(GatewayError::Unauthorized(format!(
                "session already logged in as {}",
                current
            )));
        }

        let user = self.users.bind(uid, Arc::clone(session))?;
        if let Err(e) = session.client().set_member(uid, api_key) {
            self.users.unbind(uid, session.id());
            return Err(e);
        }

        // 关闭回调可能先于 set_member 执行，此时由这里负责解绑
        if session.is_stopped() {
            self.release_user(session, uid);
            return Err(GatewayError::SessionClosed(session.id().to_string()));
        }

        info!(uid, session_id = %session.id(), "session logged in");
        let action = Action::new(
            ActionKind::SessionOnline,
            uid,
            session.id(),
            session.client().topics().to_vec(),
        );
        self.dispatch_event(Event::sync_one(user, action));
        Ok(())
    }

    /// 订阅，返回连接当前全部 topic
    ///
    /// 公共 topic 无需登录，私有 topic 需要登录。
    pub fn on_subscribe(&self, session: &Arc<Session>, topics: &[String]) -> Result<Vec<String>> {
        let (public, private): (Vec<&String>, Vec<&String>) =
            topics.iter().partition(|t| self.publics.is_public(t));
        if !private.is_empty() && !session.client().is_authenticated() {
            return Err(GatewayError::NotAuthenticated);
        }

        let added = session.client().subscribe(topics);
        for topic in &added {
            if public.iter().any(|t| *t == topic) {
                self.publics.subscribe(topic, Arc::clone(session));
            }
        }

        let private_added: Vec<String> = added
            .into_iter()
            .filter(|t| private.iter().any(|p| *p == t))
            .collect();
        if !private_added.is_empty() {
            self.notify_user(session, ActionKind::Subscribe, private_added);
        }
        Ok(session.client().topics().to_vec())
    }

    /// 取消订阅，返回连接剩余 topic
    pub fn on_unsubscribe(&self, session: &Arc<Session>, topics: &[String]) -> Result<Vec<String>> {
        let removed = session.client().unsubscribe(topics);
        let mut private_removed = Vec::with_capacity(removed.len());
        for topic in removed {
            if self.publics.is_public(&topic) {
                self.publics.unsubscribe(&topic, session.id());
            } else {
                private_removed.push(topic);
            }
        }
        if !private_removed.is_empty() {
            self.notify_user(session, ActionKind::Unsubscribe, private_removed);
        }
        Ok(session.client().topics().to_vec())
    }

    /// 客户端上行数据，转给声明了该 topic 的 acceptor
    pub fn on_input(&self, session: &Arc<Session>, topic: &str, data: Bytes) -> Result<()> {
        let uid = session.member_id();
        if uid <= 0 {
            return Err(GatewayError::NotAuthenticated);
        }
        if self.acceptors.by_topic(topic).is_empty() {
            return Err(GatewayError::InvalidArgument(format!(
                "no backend for topic {}",
                topic
            )));
        }
        self.dispatch_event(Event::SyncInput {
            uid,
            session_id: session.id().to_string(),
            topic: topic.to_string(),
            data,
        });
        Ok(())
    }

    fn notify_user(&self, session: &Arc<Session>, kind: ActionKind, topics: Vec<String>) {
        let uid = session.member_id();
        if uid <= 0 {
            return;
        }
        let Some(user) = self.users.get(uid) else {
            return;
        };
        let action = Action::new(kind, uid, session.id(), topics);
        self.dispatch_event(Event::sync_one(user, action));
    }

    /// 解绑并通知下线，重复调用时只有第一次生效
    fn release_user(&self, session: &Arc<Session>, uid: i64) {
        if let Some(user) = self.users.unbind(uid, session.id()) {
            let action = Action::new(
                ActionKind::SessionOffline,
                uid,
                session.id(),
                session.client().topics().to_vec(),
            );
            self.dispatch_event(Event::sync_one(user, action));
        }
    }

    // ---------------------------------------------------------------------
    // 事件分发
    // ---------------------------------------------------------------------

    /// 异步模式下单用户事件入队，满则丢弃并记录失败时间；其余事件同步处理
    pub fn dispatch_event(&self, event: Event) {
        if self.config.exchange_async && matches!(event, Event::SyncOneUser { .. }) {
            if let Err(e) = self.event_tx.try_send(event) {
                self.last_fail_ms.store(current_millis(), Ordering::Release);
                self.resync_pending.store(true, Ordering::Release);
                self.metrics.exchange_event_discard_total.inc();
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                debug!(reason, "exchange event dropped");
            }
            return;
        }
        self.process_event(event);
    }

    pub fn process_event(&self, event: Event) {
        match event {
            Event::ForceSyncUser { uid, acceptor_id } => {
                let snapshot = match self.users.get(uid) {
                    Some(user) if !user.is_deleted() => user.build(),
                    _ => UserSnapshot::absent(uid),
                };
                let targets = self.acceptors.targets(acceptor_id.as_deref());
                self.send_sources("force_sync_user", &targets, &[SyncSource::forced(snapshot)], false);
            }
            Event::SyncOneUser { user, action } => {
                self.process_batch(vec![(user, action)]);
            }
            Event::SyncAllUser {
                users,
                acceptor_id,
                reason,
            } => self.sync_all(users, acceptor_id.as_deref(), reason),
            Event::SyncConfig { acceptor_id } => {
                for acceptor in self.acceptors.targets(acceptor_id.as_deref()) {
                    self.send_config(&acceptor);
                }
            }
            Event::SyncInput {
                uid,
                session_id,
                topic,
                data,
            } => self.send_input(uid, session_id, topic, data),
        }
    }

    /// 合并同一用户的多个变化，每个用户只重建一次状态
    pub fn process_batch(&self, items: Vec<(Arc<User>, Option<Action>)>) {
        if items.is_empty() {
            return;
        }

        let mut order: Vec<i64> = Vec::new();
        let mut grouped: HashMap<i64, (Arc<User>, Vec<Action>)> = HashMap::new();
        for (user, action) in items {
            let uid = user.uid();
            let entry = grouped.entry(uid).or_insert_with(|| {
                order.push(uid);
                (Arc::clone(&user), Vec::new())
            });
            // 同一 uid 的用户实例可能已被重建，以最新的为准
            if !Arc::ptr_eq(&entry.0, &user) {
                entry.0 = user;
            }
            if let Some(action) = action {
                entry.1.push(action);
            }
        }

        let sources: Vec<SyncSource> = order
            .into_iter()
            .filter_map(|uid| grouped.remove(&uid))
            .map(|(user, actions)| SyncSource::new(user.build()).with_actions(actions))
            .collect();

        let targets = self.acceptors.all();
        self.send_sources("sync_one_user", &targets, &sources, false);
    }

    fn sync_all(&self, users: SyncUsers, acceptor_id: Option<&str>, reason: &'static str) {
        let targets = self.acceptors.targets(acceptor_id);
        if targets.is_empty() {
            return;
        }

        let sources: Vec<SyncSource> = match users {
            SyncUsers::All => self
                .users
                .all()
                .into_iter()
                .filter(|u| !u.is_deleted())
                .map(|u| SyncSource::new(u.build()))
                .collect(),
            SyncUsers::List(uids) => uids
                .into_iter()
                .map(|uid| match self.users.get(uid) {
                    Some(user) if !user.is_deleted() => SyncSource::new(user.build()),
                    _ => SyncSource::forced(UserSnapshot::absent(uid)),
                })
                .collect(),
        };

        let now = current_millis();
        for acceptor in &targets {
            acceptor.mark_resync(now);
            self.metrics.resync_total.with_label_values(&[reason]).inc();
        }
        info!(
            reason,
            acceptors = targets.len(),
            users = sources.len(),
            "full user resync"
        );
        self.send_sources("sync_all_user", &targets, &sources, true);
    }

    /// 为每个 acceptor 单独过滤并分批发送
    ///
    /// `full` 为 true 时即使没有条目也发送一帧 `last = true`，后端据此清理过期状态。
    fn send_sources(
        &self,
        event: &'static str,
        targets: &[Arc<Acceptor>],
        sources: &[SyncSource],
        full: bool,
    ) {
        let sync_id = self.sync_seq.fetch_add(1, Ordering::Relaxed) + 1;
        for acceptor in targets {
            if acceptor.is_closed() {
                continue;
            }
            let filter = acceptor.filter();
            let entries: Vec<UserSync> = sources
                .iter()
                .filter_map(|source| filter_entry(&filter, &self.gray, source))
                .map(UserSync::from)
                .collect();
            if entries.is_empty() && !full {
                continue;
            }

            let mut batches = split_batches(entries, self.config.sync_batch_size);
            if batches.is_empty() {
                batches.push(Vec::new());
            }
            let count = batches.len();
            for (i, users) in batches.into_iter().enumerate() {
                let payload = SyncPayload {
                    sync_id,
                    full,
                    last: i + 1 == count,
                    users,
                    inputs: Vec::new(),
                    event: event.to_string(),
                };
                match acceptor.send(BackendFrame::sync(payload)) {
                    Ok(()) => self.metrics.sync_payload_total.with_label_values(&[event]).inc(),
                    Err(e) => {
                        debug!(acceptor_id = %acceptor.id(), event, error = %e, "sync payload dropped");
                        break;
                    }
                }
            }
        }
    }

    fn send_config(&self, acceptor: &Arc<Acceptor>) {
        let mut gray_uids = self.gray.to_vec();
        gray_uids.sort_unstable();
        let payload = ConfigPayload {
            node_id: self.config.node_id.clone(),
            gray_uids,
            sync_batch_size: self.config.sync_batch_size as u32,
            max_sessions_per_user: self.config.max_sessions_per_user as u32,
            topics: acceptor.topic_confs().iter().map(Into::into).collect(),
        };
        match acceptor.send(BackendFrame::sync_config(payload)) {
            Ok(()) => self
                .metrics
                .sync_payload_total
                .with_label_values(&["sync_config"])
                .inc(),
            Err(e) => debug!(acceptor_id = %acceptor.id(), error = %e, "config payload dropped"),
        }
    }

    fn send_input(&self, uid: i64, session_id: String, topic: String, data: Bytes) {
        let targets: Vec<Arc<Acceptor>> = self
            .acceptors
            .by_topic(&topic)
            .into_iter()
            .filter(|a| a.check_user_shard(uid, &self.gray))
            .collect();
        if targets.is_empty() {
            debug!(uid, topic = %topic, "input without backend");
            return;
        }

        let sync_id = self.sync_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let input = InputMessage {
            uid,
            session_id,
            topic,
            data,
        };
        for acceptor in targets {
            let payload = SyncPayload {
                sync_id,
                full: false,
                last: true,
                users: Vec::new(),
                inputs: vec![input.clone()],
                event: "sync_input".to_string(),
            };
            match acceptor.send(BackendFrame::sync(payload)) {
                Ok(()) => self
                    .metrics
                    .sync_payload_total
                    .with_label_values(&["sync_input"])
                    .inc(),
                Err(e) => debug!(acceptor_id = %acceptor.id(), error = %e, "input dropped"),
            }
        }
    }

    // ---------------------------------------------------------------------
    // 后台消费
    // ---------------------------------------------------------------------

    /// 异步事件消费循环，只能启动一次
    ///
    /// 收到关闭信号后关闭队列，最多再处理 `drain_attempts` 批，剩余事件丢弃。
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.event_rx.lock().take() else {
            warn!("exchange consumer already running");
            return;
        };
        info!(
            batch_size = self.config.batch_size,
            queue_size = self.config.event_queue_size,
            "exchange consumer started"
        );

        loop {
            let first = tokio::select! {
                _ = wait_stopped(&mut shutdown) => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let batch = self.collect_batch(first, &mut rx);
            self.consume(batch);
        }

        rx.close();
        for _ in 0..self.config.drain_attempts {
            let Ok(first) = rx.try_recv() else {
                break;
            };
            let batch = self.collect_batch(first, &mut rx);
            self.consume(batch);
        }

        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.metrics
                .exchange_event_discard_total
                .inc_by(dropped as u64);
            warn!(dropped, "exchange events dropped on shutdown");
        }
        info!("exchange consumer stopped");
    }

    /// 取出当前已在队列中的事件，最多 `batch_size` 个
    fn collect_batch(&self, first: Event, rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let limit = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(limit.min(64));
        batch.push(first);
        while batch.len() < limit {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    fn consume(&self, batch: Vec<Event>) {
        let mut pending: Vec<(Arc<User>, Option<Action>)> = Vec::new();
        for event in batch {
            match event {
                Event::SyncOneUser { user, action } => pending.push((user, action)),
                other => {
                    self.process_batch(std::mem::take(&mut pending));
                    self.process_event(other);
                }
            }
        }
        self.process_batch(pending);
    }
}

impl SessionListener for Exchange {
    fn on_session_closed(&self, session: &Arc<Session>) {
        self.sessions.unregister(session.id());
        let topics = session.client().topics();
        self.publics.unsubscribe_all(topics.as_slice(), session.id());

        let uid = session.member_id();
        if uid > 0 {
            self.release_user(session, uid);
        }
        info!(
            session_id = %session.id(),
            uid,
            reason = session.close_reason().unwrap_or("unknown"),
            "session closed"
        );
    }
}
