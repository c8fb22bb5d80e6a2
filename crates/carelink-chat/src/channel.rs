//! Channel entity: one caregiving group's chat state.
//!
//! Holds the roster and the message log and derives everything the chat view
//! needs from them (read counts, day separators, sender grouping, unread and
//! emergency flags). No transport access; the only side effect besides its
//! own state is publishing on the [`EventBus`].

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use tracing::{debug, warn};

use carelink_common::models::{
    ChannelSnapshot, ChannelSummary, CreatorInfo, MemberResponse, MessageResponse, MessageType,
};
use carelink_common::session::SessionUser;

use crate::error::Result;
use crate::events::{EventBus, GroupEvent};
use crate::rest::{ChatApi, MessagePage};

/// Offset added to the last real sequence number for optimistic messages.
///
/// Reserved id space: a placeholder must sort after every confirmed message
/// until its echo arrives. Breaks if server sequences ever reach this range.
pub const MAX_MESSAGE_SEQ: u64 = 9_999_999_999;

/// What every channel needs from its session.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub user: Arc<SessionUser>,
    pub bus: EventBus,
    /// Display timezone for day and minute boundaries
    pub offset: FixedOffset,
}

/// Roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub user_id: String,
    pub login_id: Option<String>,
    pub username: String,
    pub profile: Option<String>,
    pub is_active: bool,
    pub last_access: DateTime<Utc>,
}

impl From<MemberResponse> for Member {
    fn from(resp: MemberResponse) -> Self {
        Self {
            user_id: resp.user_idx,
            login_id: resp.user_id,
            username: resp.username,
            profile: resp.user_profile,
            is_active: resp.is_active,
            last_access: resp.last_access_date,
        }
    }
}

/// A message in the log, with its view decoration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub seq: u64,
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_login_id: Option<String>,
    pub sender_name: String,
    pub sender_profile: Option<String>,
    pub body: String,
    pub is_active: bool,
    pub date_reg: DateTime<Utc>,
    pub date_mod: DateTime<Utc>,
    pub read_count: u32,
    /// Set only while the message awaits its server echo
    pub temp_uuid: Option<String>,
    pub file_info: Option<String>,
    pub is_day_first: bool,
    pub parent_seq: Option<u64>,
    pub is_last_child: bool,
    pub change_sender: bool,
}

impl From<MessageResponse> for ChatMessage {
    fn from(resp: MessageResponse) -> Self {
        Self {
            seq: resp.message_seq,
            message_type: resp.message_type,
            sender_id: resp.user_idx,
            sender_login_id: resp.user_id,
            sender_name: resp.username,
            sender_profile: resp.user_profile,
            body: resp.message_body,
            is_active: resp.is_active,
            date_reg: resp.date_reg,
            date_mod: resp.date_mod,
            read_count: 0,
            temp_uuid: resp.temp_uuid,
            file_info: resp.file_info,
            is_day_first: false,
            parent_seq: None,
            is_last_child: true,
            change_sender: false,
        }
    }
}

pub struct Channel {
    id: String,
    token: Option<String>,
    group_id: String,
    creator: Option<CreatorInfo>,
    emergency_target: Option<String>,
    members: Vec<Member>,
    messages: Vec<ChatMessage>,
    date_reg: Option<DateTime<Utc>>,
    date_mod: Option<DateTime<Utc>>,
    total_count: u64,
    paging_key: u32,
    emergency: bool,
    deleted: bool,
    initialized: bool,
    ctx: ChannelContext,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("members", &self.members.len())
            .field("messages", &self.messages.len())
            .field("total_count", &self.total_count)
            .field("emergency", &self.emergency)
            .finish()
    }
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        token: Option<String>,
        group_id: impl Into<String>,
        creator: Option<CreatorInfo>,
        ctx: ChannelContext,
    ) -> Self {
        Self {
            id: id.into(),
            token,
            group_id: group_id.into(),
            creator,
            emergency_target: None,
            members: Vec::new(),
            messages: Vec::new(),
            date_reg: None,
            date_mod: None,
            total_count: 0,
            paging_key: 0,
            emergency: false,
            deleted: false,
            initialized: false,
            ctx,
        }
    }

    pub fn from_summary(summary: ChannelSummary, ctx: ChannelContext) -> Self {
        let mut channel = Self::new(
            summary.channel_idx,
            Some(summary.channel_token),
            summary.group_idx,
            summary.creator_info,
            ctx,
        );
        channel.emergency_target = summary.emergency_target_user_idx;
        channel
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn creator(&self) -> Option<&CreatorInfo> {
        self.creator.as_ref()
    }

    pub fn emergency_target(&self) -> Option<&str> {
        self.emergency_target.as_deref()
    }

    pub fn set_emergency_target(&mut self, user_id: Option<String>) {
        self.emergency_target = user_id;
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Active (not retracted) messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.is_active)
    }

    /// The whole log including retracted messages.
    pub fn message_log(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn dates(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.date_reg, self.date_mod)
    }

    pub fn set_dates(&mut self, reg: Option<DateTime<Utc>>, modified: Option<DateTime<Utc>>) {
        self.date_reg = reg;
        self.date_mod = modified;
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn set_total_count(&mut self, total: u64) {
        self.total_count = total;
    }

    pub fn paging_key(&self) -> u32 {
        self.paging_key
    }

    pub fn increase_paging_key(&mut self) {
        self.paging_key = self.paging_key.saturating_add(1);
    }

    pub fn decrease_paging_key(&mut self) {
        self.paging_key = self.paging_key.saturating_sub(1);
    }

    pub fn emergency(&self) -> bool {
        self.emergency
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    /// Fetch and apply the channel snapshot. On failure the channel stays
    /// uninitialized; callers decide whether to retry.
    pub async fn load(&mut self, api: &dyn ChatApi) -> Result<()> {
        match api.channel_info(&self.id).await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!(channel_id = %self.id, error = %e, "Channel load failed");
                Err(e)
            }
        }
    }

    /// Forget the loaded log so the next snapshot is applied from scratch.
    pub fn reset_snapshot(&mut self) {
        self.messages.clear();
        self.paging_key = 0;
        self.total_count = 0;
        self.initialized = false;
    }

    /// Populate roster and log from a snapshot (message list newest first).
    pub fn apply_snapshot(&mut self, snapshot: ChannelSnapshot) {
        if let Some(first) = snapshot.user_list.first() {
            self.date_reg = first.channel_date_reg;
            self.date_mod = first.channel_date_mod;
        }
        self.load_members(snapshot.user_list);
        self.load_messages(snapshot.message_list);
        self.total_count = snapshot.total_count;
        self.refresh_emergency_flag();
        self.initialized = true;

        debug!(channel_id = %self.id, messages = self.messages.len(), "Channel initialized");
        self.ctx.bus.publish(GroupEvent::ChannelInitialized {
            channel_id: self.id.clone(),
        });
    }

    /// Append roster entries, one per user id.
    pub fn load_members(&mut self, list: Vec<MemberResponse>) {
        for resp in list {
            let member = Member::from(resp);
            match self.members.iter_mut().find(|m| m.user_id == member.user_id) {
                Some(existing) => *existing = member,
                None => self.members.push(member),
            }
        }
    }

    /// Replace the roster wholesale.
    pub fn replace_members(&mut self, list: Vec<MemberResponse>) {
        self.members.clear();
        self.load_members(list);
    }

    /// Append a newest-first page to the log in ascending order.
    pub fn load_messages(&mut self, list: Vec<MessageResponse>) {
        if list.is_empty() {
            return;
        }
        self.messages
            .extend(list.into_iter().rev().map(ChatMessage::from));
        self.increase_paging_key();
    }

    // ── Message log ───────────────────────────────────────────────────────────

    /// Merge incoming messages.
    ///
    /// Echoes of the local user's optimistic messages replace their
    /// placeholder in place; the local user's alarms are always appended.
    pub fn add_messages(&mut self, list: Vec<MessageResponse>, suppress_notify: bool) {
        for resp in list {
            let mut msg = ChatMessage::from(resp);

            if self.ctx.user.is_me(&msg.sender_id) {
                if msg.message_type == MessageType::EmergencyAlarm {
                    self.messages.push(msg);
                    continue;
                }
                let slot = msg.temp_uuid.as_deref().and_then(|temp| {
                    self.messages
                        .iter()
                        .position(|m| m.temp_uuid.as_deref() == Some(temp))
                });
                msg.temp_uuid = None;
                if let Some(index) = slot {
                    self.messages[index] = msg;
                    continue;
                }
            }

            match self
                .messages
                .iter()
                .position(|m| m.temp_uuid.is_none() && m.seq == msg.seq)
            {
                Some(index) => self.messages[index] = msg,
                None => self.messages.push(msg),
            }
        }

        self.sort_log();
        if !suppress_notify {
            self.ctx.bus.publish(GroupEvent::MessageReceived {
                channel_id: self.id.clone(),
            });
        }
    }

    /// Replace the whole log.
    pub fn set_message_list(&mut self, list: Vec<MessageResponse>, suppress_notify: bool) {
        self.messages = list.into_iter().map(ChatMessage::from).collect();
        self.sort_log();
        if !suppress_notify {
            self.ctx.bus.publish(GroupEvent::MessageReceived {
                channel_id: self.id.clone(),
            });
        }
    }

    /// Apply only messages newer than the newest log entry, retracted or not.
    pub fn update_message_list(&mut self, list: Vec<MessageResponse>) {
        let newest = self.messages.last().map(|m| m.date_reg);
        let fresh = match newest {
            Some(newest) => list.into_iter().filter(|m| m.date_reg > newest).collect(),
            None => list,
        };
        self.add_messages(fresh, true);
    }

    /// Merge an older history page (newest first) in front of the log.
    pub fn prepend_history(&mut self, page: MessagePage) {
        if page.messages.is_empty() {
            return;
        }
        for resp in page.messages.into_iter().rev() {
            if self.messages.iter().any(|m| m.seq == resp.message_seq) {
                continue;
            }
            self.messages.push(ChatMessage::from(resp));
        }
        if page.total_count > 0 {
            self.total_count = page.total_count;
        }
        self.sort_log();
        self.increase_paging_key();
    }

    /// Insert the local user's optimistic placeholder and return its sequence.
    pub fn add_pending_message(
        &mut self,
        body: impl Into<String>,
        message_type: MessageType,
        temp_uuid: impl Into<String>,
    ) -> u64 {
        let seq = self
            .messages
            .last()
            .map(|m| m.seq.saturating_add(MAX_MESSAGE_SEQ))
            .unwrap_or(MAX_MESSAGE_SEQ);
        let now = Utc::now();
        let user = &self.ctx.user;

        self.messages.push(ChatMessage {
            seq,
            message_type,
            sender_id: user.user_id.clone(),
            sender_login_id: Some(user.login_id.clone()),
            sender_name: user.username.clone(),
            sender_profile: None,
            body: body.into(),
            is_active: true,
            date_reg: now,
            date_mod: now,
            read_count: 0,
            temp_uuid: Some(temp_uuid.into()),
            file_info: None,
            is_day_first: false,
            parent_seq: None,
            is_last_child: true,
            change_sender: false,
        });
        seq
    }

    fn sort_log(&mut self) {
        self.messages.sort_by_key(|m| m.date_reg);
    }

    // ── Roster ────────────────────────────────────────────────────────────────

    /// Everyone goes inactive, then the listed ids come back online as of `as_of`.
    pub fn update_roster(&mut self, active_ids: &[String], as_of: DateTime<Utc>) {
        for member in &mut self.members {
            member.is_active = active_ids.iter().any(|id| *id == member.user_id);
            if member.is_active {
                member.last_access = as_of;
            }
        }
    }

    pub fn update_member_online(&mut self, user_id: &str, as_of: DateTime<Utc>) {
        for member in self.members.iter_mut().filter(|m| m.user_id == user_id) {
            member.is_active = true;
            member.last_access = as_of;
        }
    }

    pub fn mark_member_offline(&mut self, user_id: &str, last_access: Option<DateTime<Utc>>) {
        for member in self.members.iter_mut().filter(|m| m.user_id == user_id) {
            if let Some(at) = last_access {
                member.last_access = at;
            }
            member.is_active = false;
        }
    }

    /// Returns false if `user_id` is not in the roster.
    pub fn set_member_last_access(&mut self, user_id: &str, at: DateTime<Utc>) -> bool {
        match self.members.iter_mut().find(|m| m.user_id == user_id) {
            Some(member) => {
                member.last_access = at;
                true
            }
            None => false,
        }
    }

    pub fn remove_member(&mut self, user_id: &str, is_current: bool) {
        let before = self.members.len();
        self.members.retain(|m| m.user_id != user_id);
        if is_current && self.members.len() != before {
            self.ctx.bus.publish(GroupEvent::RemoveUser {
                channel_id: self.id.clone(),
                user_id: user_id.to_owned(),
            });
        }
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.messages.clear();
    }

    // ── Derivations ───────────────────────────────────────────────────────────

    /// Read count = members whose last access is at or after the message.
    pub fn recompute_read_counts(&mut self) {
        let members = &self.members;
        for msg in self.messages.iter_mut().filter(|m| m.is_active) {
            let read = members.iter().filter(|u| u.last_access >= msg.date_reg).count();
            msg.read_count = u32::try_from(read).unwrap_or(u32::MAX);
        }
        self.publish_update();
    }

    /// Flag the first message of every calendar day.
    ///
    /// The oldest loaded message only counts as a day start when the whole
    /// history is loaded.
    pub fn partition_by_day(&mut self) {
        let offset = self.ctx.offset;
        for msg in &mut self.messages {
            msg.is_day_first = false;
        }

        let active = self.active_indices();
        if let Some(&first) = active.first() {
            if self.total_count == active.len() as u64 {
                self.messages[first].is_day_first = true;
            }
        }
        for pair in active.windows(2) {
            let prev = local_date(self.messages[pair[0]].date_reg, offset);
            let cur = local_date(self.messages[pair[1]].date_reg, offset);
            if prev != cur {
                self.messages[pair[1]].is_day_first = true;
            }
        }
        self.publish_update();
    }

    /// Group consecutive messages from one sender within the same minute.
    pub fn build_grouping_markers(&mut self) {
        let offset = self.ctx.offset;
        let active = self.active_indices();
        for &i in &active {
            let msg = &mut self.messages[i];
            msg.parent_seq = None;
            msg.is_last_child = true;
            msg.change_sender = false;
        }

        for pair in active.windows(2) {
            let (p, c) = (pair[0], pair[1]);
            let prev_system = self.messages[p].message_type.is_system();
            let cur_system = self.messages[c].message_type.is_system();

            match (prev_system, cur_system) {
                (false, false) => {
                    let (prev, cur) = (&self.messages[p], &self.messages[c]);
                    if prev.sender_id != cur.sender_id {
                        self.messages[c].change_sender = true;
                    } else if local_minute(prev.date_reg, offset) == local_minute(cur.date_reg, offset) {
                        let parent = prev.parent_seq.unwrap_or(prev.seq);
                        self.messages[p].is_last_child = false;
                        self.messages[c].parent_seq = Some(parent);
                    }
                }
                (true, false) => self.messages[c].change_sender = true,
                (false, true) => {
                    self.messages[p].is_last_child = true;
                    self.messages[c].change_sender = true;
                }
                (true, true) => {}
            }
        }
    }

    /// Newest human-visible message, else the newest message of any type.
    pub fn most_recent_displayable_message(&self) -> Option<&ChatMessage> {
        self.messages()
            .filter(|m| m.message_type.is_displayable())
            .last()
            .or_else(|| self.messages().last())
    }

    /// Newest message that is not an enter/leave notice.
    pub fn last_conversation_message(&self) -> Option<&ChatMessage> {
        self.messages()
            .filter(|m| !m.message_type.is_system())
            .last()
            .or_else(|| self.messages().last())
    }

    pub fn my_last_access(&self) -> Option<DateTime<Utc>> {
        self.member(&self.ctx.user.user_id).map(|m| m.last_access)
    }

    /// Someone else wrote after the local user last looked.
    pub fn has_unread(&self) -> bool {
        let Some(last) = self.most_recent_displayable_message() else {
            return false;
        };
        if self.ctx.user.is_me(&last.sender_id) {
            return false;
        }
        self.my_last_access()
            .is_some_and(|seen| last.date_reg > seen)
    }

    /// Unseen emergency-class messages raise the flag. Left untouched when
    /// the local user is not in the roster or the log is empty.
    pub fn refresh_emergency_flag(&mut self) {
        let Some(seen) = self.my_last_access() else {
            return;
        };
        if self.messages().next().is_none() {
            return;
        }
        let emergency = self
            .messages()
            .any(|m| m.date_reg > seen && m.message_type.is_emergency());
        self.emergency = emergency;
    }

    /// Acknowledge the emergency state when the channel is opened.
    pub fn read_emergency(&mut self) {
        self.emergency = false;
    }

    fn active_indices(&self) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_active)
            .map(|(i, _)| i)
            .collect()
    }

    fn publish_update(&self) {
        self.ctx.bus.publish(GroupEvent::Update {
            channel_id: self.id.clone(),
        });
    }
}

fn local_date(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

fn local_minute(at: DateTime<Utc>, offset: FixedOffset) -> (NaiveDate, u32, u32) {
    let local = at.with_timezone(&offset);
    (local.date_naive(), local.hour(), local.minute())
}
