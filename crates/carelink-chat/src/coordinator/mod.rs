//! Group coordinator.
//!
//! Owns the channel collection and the current channel/group selection,
//! turns transport events into channel mutations and user intents into
//! transport events. One instance per session; role differences live in
//! [`RolePolicy`].

pub mod policy;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use carelink_common::error::CareLinkError;
use carelink_common::models::{
    ChannelSnapshot, CreateChannelResponse, EnterChannelResponse, MessageType,
};
use carelink_common::session::SessionUser;
use carelink_common::store::{LocalStore, keys};

use crate::channel::{Channel, ChannelContext, ChatMessage};
use crate::error::{ChatError, Result};
use crate::events::{EventBus, GroupEvent};
use crate::protocol::{
    AccessUpdateRequest, ChannelRequest, CreateChannelRequest, EnterChannelRequest,
    FileMessageRequest, InitChannelRequest, MembershipChange, MembershipRequest, MessageBatch,
    MessageSyncRequest, MessageUpdate, OutboundEvent, RosterChange, TextMessageRequest,
    TransportEvent, UserAccessUpdate, UserDisconnected,
};
use crate::rest::{ChatApi, FileUpload, MessagePage, SavedFile};
use crate::transport::ChatTransport;

pub use policy::{ManagerPolicy, RolePolicy, RouteTarget, UserPolicy, policy_for};

/// Client correlation id for an optimistic message.
pub fn new_temp_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disconnected,
    Connecting,
    /// Connected, waiting for `init.channel.complete`
    Connected,
    Ready,
}

/// Result of background work, fed back into the coordinator's event loop.
#[derive(Debug)]
pub enum Completion {
    ChannelLoaded {
        channel_id: String,
        result: Result<ChannelSnapshot>,
    },
    PageLoaded {
        channel_id: String,
        paging_key: u32,
        result: Result<MessagePage>,
    },
    FileUploaded {
        channel_id: String,
        temp_uuid: String,
        message_type: MessageType,
        result: Result<SavedFile>,
    },
}

/// Body of an outgoing message.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Text(String),
    File {
        file_name: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub body: MessageBody,
    pub message_type: MessageType,
    pub temp_uuid: String,
}

impl OutgoingMessage {
    pub fn text(message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(body.into()),
            message_type,
            temp_uuid: new_temp_uuid(),
        }
    }
}

/// Everything a coordinator is built from.
pub struct CoordinatorDeps {
    pub user: Arc<SessionUser>,
    pub policy: Box<dyn RolePolicy>,
    pub transport: Arc<dyn ChatTransport>,
    pub api: Arc<dyn ChatApi>,
    pub store: Arc<dyn LocalStore>,
    pub bus: EventBus,
    pub offset: chrono::FixedOffset,
    /// Messages per history page
    pub page_size: u32,
}

pub struct GroupCoordinator {
    policy: Box<dyn RolePolicy>,
    transport: Arc<dyn ChatTransport>,
    api: Arc<dyn ChatApi>,
    store: Arc<dyn LocalStore>,
    ctx: ChannelContext,
    page_size: u32,
    state: CoordinatorState,
    channels: Vec<Channel>,
    current_channel_id: Option<String>,
    current_group_id: Option<String>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Option<mpsc::UnboundedReceiver<Completion>>,
}

fn emit<T: Serialize>(transport: &dyn ChatTransport, event: OutboundEvent, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => transport.emit_event(event, value),
        Err(e) => warn!(event = event.name(), error = %e, "Coordinator: unserializable payload"),
    }
}

impl GroupCoordinator {
    /// Build a coordinator; the persisted current group is restored.
    pub fn new(deps: CoordinatorDeps) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let current_group_id = deps.store.get(keys::CURRENT_GROUP);
        Self {
            policy: deps.policy,
            transport: deps.transport,
            api: deps.api,
            store: deps.store,
            ctx: ChannelContext {
                user: deps.user,
                bus: deps.bus,
                offset: deps.offset,
            },
            page_size: deps.page_size,
            state: CoordinatorState::Disconnected,
            channels: Vec::new(),
            current_channel_id: None,
            current_group_id,
            completions_tx,
            completions_rx: Some(completions_rx),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Open the transport. Events flow in through [`handle_event`](Self::handle_event).
    pub async fn launch(&mut self) -> Result<()> {
        self.state = CoordinatorState::Connecting;
        self.transport.connect().await
    }

    /// Clear the channel collection and selection and release the transport.
    pub fn destroy(&mut self) {
        info!(user_id = %self.ctx.user.user_id, "Coordinator: destroy");
        self.channels.clear();
        self.current_channel_id = None;
        self.current_group_id = None;
        if let Err(e) = self.store.remove(keys::CURRENT_GROUP) {
            warn!(error = %e, "Coordinator: failed to clear current group");
        }
        self.transport.destroy();
        self.state = CoordinatorState::Disconnected;
    }

    /// The receiving end of background completions. Taken once by the session pump.
    pub fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<Completion>> {
        self.completions_rx.take()
    }

    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        Arc::clone(&self.transport)
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.ctx.bus.subscribe()
    }

    pub fn user(&self) -> &SessionUser {
        &self.ctx.user
    }

    pub fn policy(&self) -> &dyn RolePolicy {
        self.policy.as_ref()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CoordinatorState::Ready
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn current_channel_id(&self) -> Option<&str> {
        self.current_channel_id.as_deref()
    }

    pub fn current_group_id(&self) -> Option<&str> {
        self.current_group_id.as_deref()
    }

    /// Channels that are not soft-deleted.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| !c.is_deleted())
    }

    pub fn group(&self, group_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.group_id() == group_id)
    }

    pub fn channel_by_id(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id() == channel_id)
    }

    pub fn channel_by_id_mut(&mut self, channel_id: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id() == channel_id)
    }

    pub fn current_group(&self) -> Option<&Channel> {
        self.current_group_id.as_deref().and_then(|g| self.group(g))
    }

    /// Token for `channel_id`, or for the current group's channel.
    pub fn channel_token(&self, channel_id: Option<&str>) -> Option<&str> {
        match channel_id {
            Some(id) => self.channel_by_id(id).and_then(Channel::token),
            None => self.current_group().and_then(Channel::token),
        }
    }

    pub fn group_id_by_channel_id(&self, channel_id: &str) -> Option<&str> {
        self.channels()
            .find(|c| c.id() == channel_id)
            .map(Channel::group_id)
    }

    /// Newest non-system message of `channel_id`, or of the current group.
    pub fn last_message(&self, channel_id: Option<&str>) -> Option<&ChatMessage> {
        let channel = match channel_id {
            Some(id) => self.channel_by_id(id),
            None => self.current_group(),
        };
        channel.and_then(Channel::last_conversation_message)
    }

    /// The group the local user created (the target of device alarms).
    pub fn my_group(&self) -> Option<&Channel> {
        let me = &self.ctx.user.user_id;
        self.channels
            .iter()
            .find(|c| c.creator().is_some_and(|creator| creator.user_idx == *me))
    }

    fn position(&self, channel_id: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.id() == channel_id)
    }

    fn is_current(&self, channel_id: &str) -> bool {
        self.current_channel_id.as_deref() == Some(channel_id)
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    /// Select the dashboard group; persisted. `None` also closes the chat view.
    pub fn set_current_group(&mut self, group_id: Option<String>) {
        let persisted = match &group_id {
            Some(id) => self.store.set(keys::CURRENT_GROUP, id),
            None => {
                self.current_channel_id = None;
                self.store.remove(keys::CURRENT_GROUP)
            }
        };
        if let Err(e) = persisted {
            warn!(error = %e, "Coordinator: failed to persist current group");
        }
        self.current_group_id = group_id.clone();
        self.ctx.bus.publish(GroupEvent::ChangeGroup { group_id });
    }

    /// Open (`Some`) or close (`None`) the chat view.
    pub fn set_current_channel(&mut self, channel_id: Option<&str>) {
        let user = Arc::clone(&self.ctx.user);
        match channel_id {
            Some(id) => {
                let Some(channel) = self.channel_by_id(id) else {
                    return;
                };
                let group_id = channel.group_id().to_owned();
                if let Some(token) = channel.token() {
                    emit(
                        self.transport.as_ref(),
                        OutboundEvent::JoinChannel,
                        &ChannelRequest {
                            user_idx: user.user_id.clone(),
                            user_type: user.role,
                            channel_idx: id.to_owned(),
                            channel_token: token.to_owned(),
                        },
                    );
                }
                self.current_channel_id = Some(id.to_owned());
                self.current_group_id = Some(group_id);
            }
            None => {
                if let Some(channel) = self.current_group() {
                    if let Some(token) = channel.token() {
                        let channel_idx = self
                            .current_channel_id
                            .clone()
                            .unwrap_or_else(|| channel.id().to_owned());
                        emit(
                            self.transport.as_ref(),
                            OutboundEvent::QuitChannel,
                            &ChannelRequest {
                                user_idx: user.user_id.clone(),
                                user_type: user.role,
                                channel_idx,
                                channel_token: token.to_owned(),
                            },
                        );
                    }
                }
                self.current_channel_id = None;
            }
        }
    }

    pub fn change_current_channel_id(&mut self, channel_id: Option<String>) {
        self.current_channel_id = channel_id;
    }

    pub fn update_emergency_state(&mut self) {
        for channel in &mut self.channels {
            channel.refresh_emergency_flag();
        }
    }

    // ── Intents ───────────────────────────────────────────────────────────────

    pub fn create_group(&self, user_id: &str, channel_id: &str) {
        emit(
            self.transport.as_ref(),
            OutboundEvent::CreateChannel,
            &CreateChannelRequest {
                user_idx: user_id.to_owned(),
                message_channel_idx: channel_id.to_owned(),
            },
        );
    }

    pub fn enter_channel(&self, user_id: &str, channel_id: &str, group_id: &str) {
        debug!(channel_id, group_id, "Coordinator: enter channel");
        emit(
            self.transport.as_ref(),
            OutboundEvent::EnterChannel,
            &EnterChannelRequest {
                user_idx: user_id.to_owned(),
                message_channel_idx: channel_id.to_owned(),
                group_idx: group_id.to_owned(),
            },
        );
    }

    /// Open a channel's chat view and acknowledge its emergency state.
    pub fn join_channel(&mut self, channel_id: &str) {
        let Some(index) = self.position(channel_id) else {
            return;
        };
        let Some(token) = self.channels[index].token().map(str::to_owned) else {
            return;
        };
        self.current_channel_id = Some(channel_id.to_owned());
        self.channels[index].read_emergency();
        emit(
            self.transport.as_ref(),
            OutboundEvent::JoinChannel,
            &ChannelRequest {
                user_idx: self.ctx.user.user_id.clone(),
                user_type: self.ctx.user.role,
                channel_idx: channel_id.to_owned(),
                channel_token: token,
            },
        );
    }

    pub fn quit_channel(&mut self, channel_id: &str) {
        let Some(token) = self.channel_token(Some(channel_id)).map(str::to_owned) else {
            return;
        };
        if self.is_current(channel_id) {
            self.current_channel_id = None;
        }
        emit(
            self.transport.as_ref(),
            OutboundEvent::QuitChannel,
            &ChannelRequest {
                user_idx: self.ctx.user.user_id.clone(),
                user_type: self.ctx.user.role,
                channel_idx: channel_id.to_owned(),
                channel_token: token,
            },
        );
    }

    pub fn remove_user(&self, group_id: &str, target_user_id: &str, channel_id: &str) {
        self.emit_membership(OutboundEvent::RemoveUser, group_id, target_user_id, channel_id);
    }

    pub fn leave_group(&self, group_id: &str, target_user_id: &str, channel_id: &str) {
        self.emit_membership(OutboundEvent::LeaveChannel, group_id, target_user_id, channel_id);
    }

    fn emit_membership(
        &self,
        event: OutboundEvent,
        group_id: &str,
        target_user_id: &str,
        channel_id: &str,
    ) {
        let Some(token) = self.channel_token(Some(channel_id)) else {
            return;
        };
        emit(
            self.transport.as_ref(),
            event,
            &MembershipRequest {
                group_idx: group_id.to_owned(),
                target_user_idx: target_user_id.to_owned(),
                channel_idx: channel_id.to_owned(),
                channel_token: token.to_owned(),
            },
        );
    }

    /// Send a message. The caller has already inserted the placeholder.
    ///
    /// Text and emergency messages go straight to the transport; files are
    /// uploaded first and announced once the server assigned a sequence.
    pub fn send_chat_message(&mut self, message: OutgoingMessage) {
        let channel_id = match self.policy.route_target(message.message_type) {
            RouteTarget::CurrentChannel => self.current_channel_id.clone(),
            RouteTarget::OwnGroup => self.my_group().map(|c| c.id().to_owned()),
            RouteTarget::Unroutable => {
                warn!(message_type = ?message.message_type, role = %self.policy.role(), "Coordinator: message not routable");
                self.publish_send_failed(message.temp_uuid);
                return;
            }
        };
        let Some(channel_id) = channel_id else {
            debug!("Coordinator: no target channel for message");
            return;
        };

        if !message.message_type.is_file() {
            let Some(token) = self.channel_token(Some(&channel_id)) else {
                return;
            };
            let body = match message.body {
                MessageBody::Text(text) => text,
                MessageBody::File { .. } => String::new(),
            };
            emit(
                self.transport.as_ref(),
                OutboundEvent::SendMessage,
                &TextMessageRequest {
                    message_body: body,
                    message_type: message.message_type,
                    channel_token: token.to_owned(),
                    temp_uuid: message.temp_uuid,
                },
            );
            return;
        }

        let MessageBody::File { file_name, mime_type, bytes } = message.body else {
            warn!(temp_uuid = %message.temp_uuid, "Coordinator: file message without a file");
            self.publish_send_failed(message.temp_uuid);
            return;
        };
        let upload = FileUpload {
            channel_id: channel_id.clone(),
            message_type: message.message_type,
            temp_uuid: message.temp_uuid.clone(),
            file_name,
            mime_type,
            bytes,
        };
        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        let (temp_uuid, message_type) = (message.temp_uuid, message.message_type);
        tokio::spawn(async move {
            let result = api.save_message_file(upload).await;
            let _ = tx.send(Completion::FileUploaded {
                channel_id,
                temp_uuid,
                message_type,
                result,
            });
        });
    }

    /// Fetch the next page of older history for `channel_id`.
    pub fn load_previous_messages(&self, channel_id: &str) {
        let Some(channel) = self.channel_by_id(channel_id) else {
            return;
        };
        let paging_key = channel.paging_key();
        let page_size = self.page_size;
        let channel_id = channel_id.to_owned();
        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.message_page(&channel_id, paging_key, page_size).await;
            let _ = tx.send(Completion::PageLoaded {
                channel_id,
                paging_key,
                result,
            });
        });
    }

    /// Retry a channel's snapshot load in the background.
    ///
    /// The channel's log is reset now; the snapshot arrives later as a
    /// [`Completion::ChannelLoaded`].
    pub fn reload_channel(&mut self, channel_id: &str) -> Result<()> {
        let channel = self.channel_by_id_mut(channel_id).ok_or_else(|| {
            ChatError::from(CareLinkError::NotFound {
                resource: format!("Channel {channel_id}"),
            })
        })?;
        channel.reset_snapshot();
        self.spawn_load(channel_id.to_owned());
        Ok(())
    }

    fn spawn_load(&self, channel_id: String) {
        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.channel_info(&channel_id).await;
            let _ = tx.send(Completion::ChannelLoaded { channel_id, result });
        });
    }

    fn publish_send_failed(&self, temp_uuid: String) {
        self.ctx.bus.publish(GroupEvent::SendFailed { temp_uuid });
    }

    // ── Transport events ──────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: TransportEvent) {
        if !self.policy.subscribes_to(event.kind()) {
            return;
        }
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => {
                debug!("Coordinator: transport disconnected");
                self.state = CoordinatorState::Disconnected;
                self.ctx.bus.publish(GroupEvent::Disconnected);
            }
            TransportEvent::ReconnectFailed { attempts } => {
                warn!(attempts, "Coordinator: transport gave up reconnecting");
                self.state = CoordinatorState::Disconnected;
                self.ctx.bus.publish(GroupEvent::ReconnectFailed);
            }
            TransportEvent::InitChannelComplete(list) => self.on_init_complete(list),
            TransportEvent::CreateChannelComplete(resp) => self.on_create_complete(resp),
            TransportEvent::EnterChannelComplete(resp) => self.on_enter_complete(resp),
            TransportEvent::JoinChannelComplete(change) => self.on_join_complete(change),
            TransportEvent::QuitChannelComplete(change) => {
                if let Some(channel) = self.channel_by_id_mut(&change.message_channel_idx) {
                    channel.update_roster(&change.user_list, change.access_date);
                }
            }
            TransportEvent::UserJoin(change) => self.on_user_join(change),
            TransportEvent::UserQuit(change) => {
                if let Some(channel) = self.channel_by_id_mut(&change.message_channel_idx) {
                    channel.update_roster(&change.user_list, change.access_date);
                    let channel_id = channel.id().to_owned();
                    self.ctx.bus.publish(GroupEvent::UserQuit { channel_id });
                }
            }
            TransportEvent::UserDisconnected(dt) => self.on_user_disconnected(dt),
            TransportEvent::RosterSnapshot(ids) => self.on_roster_snapshot(ids),
            TransportEvent::MessageReceived(batch) => self.on_message_received(batch),
            TransportEvent::MessageUpdated(update) => self.on_message_updated(update),
            TransportEvent::UserUpdated(update) => self.on_user_updated(update),
            TransportEvent::RemoveUser(change) => self.on_remove_user(change),
            TransportEvent::DeleteUser(deleted) => {
                if self.ctx.user.is_me(&deleted.user_idx) {
                    self.on_session_revoked();
                }
            }
            TransportEvent::LeaveChannelComplete(change) => self.on_leave_complete(change),
            TransportEvent::LeaveByOther(change) => self.on_leave_by_other(change),
            TransportEvent::ErrorReceived(message) => {
                warn!(%message, "Coordinator: server error");
                self.ctx.bus.publish(GroupEvent::ServerError { message });
            }
        }
    }

    fn on_connected(&mut self) {
        self.state = CoordinatorState::Connected;
        emit(
            self.transport.as_ref(),
            OutboundEvent::InitChannel,
            &InitChannelRequest {
                user_idx: self.ctx.user.user_id.clone(),
                state_reg: self.policy.init_filter(),
            },
        );
        self.ctx.bus.publish(GroupEvent::LoadStart);
    }

    fn on_init_complete(&mut self, list: Vec<carelink_common::models::ChannelSummary>) {
        info!(channels = list.len(), "Coordinator: channel list received");
        self.channels = list
            .into_iter()
            .map(|summary| Channel::from_summary(summary, self.ctx.clone()))
            .collect();
        let ids: Vec<String> = self.channels.iter().map(|c| c.id().to_owned()).collect();
        for id in ids {
            self.spawn_load(id);
        }

        self.state = CoordinatorState::Ready;
        let selected_present = self
            .current_group_id
            .as_deref()
            .is_some_and(|g| self.group(g).is_some());
        if !selected_present {
            let first = self.channels.first().map(|c| c.group_id().to_owned());
            self.set_current_group(first);
        }
        self.ctx.bus.publish(GroupEvent::LoadComplete);
    }

    fn insert_channel(&mut self, channel: Channel) {
        match self.position(channel.id()) {
            Some(index) => self.channels[index] = channel,
            None => self.channels.push(channel),
        }
    }

    fn on_create_complete(&mut self, resp: CreateChannelResponse) {
        let mut channel = Channel::new(
            resp.message_channel_idx,
            Some(resp.channel_token),
            resp.group_idx,
            resp.creator_info,
            self.ctx.clone(),
        );
        channel.set_dates(resp.date_reg, resp.date_mod);
        let channel_id = channel.id().to_owned();
        self.insert_channel(channel);
        self.ctx.bus.publish(GroupEvent::AddChannel { channel_id });
    }

    fn on_enter_complete(&mut self, resp: EnterChannelResponse) {
        if self.ctx.user.is_me(&resp.user_idx) {
            let mut channel = Channel::new(
                resp.channel_idx,
                Some(resp.channel_token),
                resp.group_idx.clone(),
                resp.creator_info,
                self.ctx.clone(),
            );
            channel.set_dates(resp.channel_date_reg, resp.channel_date_mod);
            channel.set_total_count(resp.total_count);
            channel.set_emergency_target(resp.emergency_target_user_idx);
            channel.load_members(resp.user_list);
            channel.load_messages(resp.message_list);
            self.insert_channel(channel);

            if self.current_group_id.is_none() {
                self.set_current_group(Some(resp.group_idx));
            }
            return;
        }

        let Some(channel) = self.channels.iter_mut().find(|c| c.group_id() == resp.group_idx)
        else {
            return;
        };
        channel.replace_members(resp.user_list);
        let newest_seq = channel.messages().last().map(|m| m.seq);
        let fresh = match newest_seq {
            Some(seq) => resp
                .message_list
                .into_iter()
                .filter(|m| m.message_seq > seq)
                .collect(),
            None => resp.message_list,
        };
        channel.add_messages(fresh, true);
        let channel_id = channel.id().to_owned();
        self.ctx.bus.publish(GroupEvent::UserEnter { channel_id });
    }

    fn on_join_complete(&mut self, change: RosterChange) {
        let Some(channel) = self.channel_by_id_mut(&change.message_channel_idx) else {
            return;
        };
        if !change.message_list.is_empty() {
            channel.set_message_list(change.message_list, true);
        }
        channel.update_roster(&change.user_list, change.access_date);
        channel.recompute_read_counts();
        channel.partition_by_day();
        channel.build_grouping_markers();
        let channel_id = channel.id().to_owned();
        self.ctx.bus.publish(GroupEvent::Update { channel_id });
    }

    fn on_user_join(&mut self, change: RosterChange) {
        let is_current = self.is_current(&change.message_channel_idx);
        let Some(channel) = self.channel_by_id_mut(&change.message_channel_idx) else {
            return;
        };
        channel.update_roster(&change.user_list, change.access_date);
        if is_current {
            channel.recompute_read_counts();
        }
        let channel_id = channel.id().to_owned();
        self.ctx.bus.publish(GroupEvent::UserJoin { channel_id });
    }

    fn on_user_disconnected(&mut self, dt: UserDisconnected) {
        let last_access = dt.channel_idx.as_ref().and(dt.last_access_date);
        for channel in &mut self.channels {
            channel.mark_member_offline(&dt.user_idx, last_access);
        }
    }

    fn on_roster_snapshot(&mut self, ids: Vec<String>) {
        let Some(current) = self.current_channel_id.clone() else {
            return;
        };
        if let Some(channel) = self.channel_by_id_mut(&current) {
            channel.update_roster(&ids, Utc::now());
            channel.recompute_read_counts();
        }
    }

    fn on_message_received(&mut self, batch: MessageBatch) {
        let Some(first) = batch.message_info.first() else {
            return;
        };
        let channel_id = first.message_channel_idx.clone();
        let sender = first.user_idx.clone();
        let sent_at = first.date_reg;
        let is_alarm = first.message_type == MessageType::EmergencyAlarm;
        let is_other = !self.ctx.user.is_me(&sender);
        let is_current = self.is_current(&channel_id);

        let Some(index) = self.position(&channel_id) else {
            debug!(%channel_id, "Coordinator: message for unknown channel");
            return;
        };
        let me = self.ctx.user.user_id.clone();
        let channel = &mut self.channels[index];
        channel.update_member_online(&sender, sent_at);
        channel.add_messages(batch.message_info, !is_alarm && !is_other);
        channel.set_total_count(batch.total_count);

        if is_other && is_current {
            channel.update_member_online(&me, sent_at);
            if let Some(token) = channel.token() {
                emit(
                    self.transport.as_ref(),
                    OutboundEvent::UpdateUser,
                    &AccessUpdateRequest {
                        channel_token: token.to_owned(),
                        last_access_date: sent_at,
                    },
                );
            }
        } else if is_other {
            channel.refresh_emergency_flag();
        }

        if is_current {
            channel.partition_by_day();
            channel.build_grouping_markers();
            channel.recompute_read_counts();
        }
    }

    fn on_message_updated(&mut self, update: MessageUpdate) {
        if let Some(channel) = self.channel_by_id_mut(&update.channel_idx) {
            channel.update_message_list(update.message_info);
            channel.set_total_count(update.total_count);
            channel.recompute_read_counts();
            channel.build_grouping_markers();
            channel.partition_by_day();
        }
        self.ctx.bus.publish(GroupEvent::Update {
            channel_id: update.channel_idx,
        });
    }

    fn on_user_updated(&mut self, update: UserAccessUpdate) {
        if self.ctx.user.is_me(&update.user_idx) {
            return;
        }
        if let Some(channel) = self.channel_by_id_mut(&update.message_channel_idx) {
            channel.set_member_last_access(&update.user_idx, update.last_access_date);
            channel.recompute_read_counts();
        }
    }

    fn on_remove_user(&mut self, change: MembershipChange) {
        let is_current = self.is_current(&change.channel_idx);
        let Some(index) = self.position(&change.channel_idx) else {
            return;
        };
        let channel = &mut self.channels[index];
        if let Some(user_id) = change.user_idx.as_deref() {
            channel.remove_member(user_id, is_current);
        }
        if let Some(token) = channel.token() {
            emit(
                self.transport.as_ref(),
                OutboundEvent::UpdateMessage,
                &MessageSyncRequest {
                    channel_idx: change.channel_idx.clone(),
                    channel_token: token.to_owned(),
                },
            );
        }
    }

    /// Fatal: the server deleted the local user.
    fn on_session_revoked(&mut self) {
        warn!(user_id = %self.ctx.user.user_id, "Coordinator: session revoked by server");
        for key in keys::SESSION {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "Coordinator: failed to clear session key");
            }
        }
        self.destroy();
        self.ctx.bus.publish(GroupEvent::SessionTerminated);
    }

    /// Drop the group's channel and move the selection if it pointed there.
    /// Returns whether the current group changed.
    fn drop_group(&mut self, group_id: &str) -> bool {
        self.channels.retain(|c| c.group_id() != group_id);
        if self.current_group_id.as_deref() != Some(group_id) {
            return false;
        }
        let next = self.channels.first().map(|c| c.group_id().to_owned());
        self.set_current_group(next);
        true
    }

    fn on_leave_by_other(&mut self, change: MembershipChange) {
        let targets_me = change
            .user_idx
            .as_deref()
            .is_none_or(|id| self.ctx.user.is_me(id));
        if !targets_me {
            return;
        }
        info!(group_id = %change.group_idx, "Coordinator: removed from group");
        self.drop_group(&change.group_idx);
        self.ctx.bus.publish(GroupEvent::Kicked {
            channel_id: change.channel_idx,
            user_id: change.user_idx,
        });
    }

    fn on_leave_complete(&mut self, change: MembershipChange) {
        if !change.user_idx.as_deref().is_some_and(|id| self.ctx.user.is_me(id)) {
            return;
        }
        if self.drop_group(&change.group_idx) && !self.channels.is_empty() {
            self.change_current_channel_id(None);
        }
        self.ctx.bus.publish(GroupEvent::LeaveChannel {
            channel_id: change.channel_idx,
        });
    }

    // ── Completions ───────────────────────────────────────────────────────────

    /// Apply background work, unless its target is gone.
    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ChannelLoaded { channel_id, result } => {
                let Some(channel) = self.channel_by_id_mut(&channel_id) else {
                    debug!(%channel_id, "Coordinator: stale channel load ignored");
                    return;
                };
                if channel.is_initialized() {
                    return;
                }
                match result {
                    Ok(snapshot) => channel.apply_snapshot(snapshot),
                    Err(e) => warn!(%channel_id, error = %e, "Coordinator: channel load failed"),
                }
            }
            Completion::PageLoaded {
                channel_id,
                paging_key,
                result,
            } => {
                let Some(channel) = self.channel_by_id_mut(&channel_id) else {
                    return;
                };
                if channel.paging_key() != paging_key {
                    debug!(%channel_id, paging_key, "Coordinator: stale history page ignored");
                    return;
                }
                match result {
                    Ok(page) => {
                        channel.prepend_history(page);
                        channel.partition_by_day();
                        channel.build_grouping_markers();
                        channel.recompute_read_counts();
                    }
                    Err(e) => warn!(%channel_id, error = %e, "Coordinator: history page failed"),
                }
            }
            Completion::FileUploaded {
                channel_id,
                temp_uuid,
                message_type,
                result,
            } => match result {
                Ok(saved) => {
                    let Some(token) = self.channel_token(Some(&channel_id)) else {
                        debug!(%channel_id, "Coordinator: upload finished for a channel that is gone");
                        return;
                    };
                    emit(
                        self.transport.as_ref(),
                        OutboundEvent::SendMessage,
                        &FileMessageRequest {
                            message_seq: saved.message_seq,
                            message_type,
                            temp_uuid,
                            channel_token: token.to_owned(),
                        },
                    );
                }
                Err(e) => {
                    warn!(%channel_id, error = %e, message = %e.result_message(), "Coordinator: upload failed");
                    self.publish_send_failed(temp_uuid);
                }
            },
        }
    }
}
