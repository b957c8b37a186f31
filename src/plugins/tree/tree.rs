//! In-memory conversation tree.
//!
//! Every mutator validates first and only then changes state, so a returned
//! error always means "nothing happened". Mutators do no I/O; they report what
//! the caller should do next through [`Effect`]s.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use smallvec::SmallVec;

use crate::services::ai::{AiError, ChatMessage};
use crate::services::ids::ConversationId;
use crate::services::prompts;

use super::TreeError;
use super::node::{Node, NodeType, node_id};

/// Follow-up work requested by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Write the conversation record (only emitted once a handle is assigned).
    Persist,
    /// Kick off best-effort title generation in the background.
    GenerateTitle,
}

pub type Effects = SmallVec<[Effect; 2]>;

/// Result of a mutation plus the effects it asks for.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Applied<T> {
    pub value: T,
    pub effects: Effects,
}

impl<T> Applied<T> {
    fn new(value: T, effects: Effects) -> Self {
        Self { value, effects }
    }

    pub fn persists(&self) -> bool {
        self.effects.contains(&Effect::Persist)
    }
}

/// How a generation call ended, as recorded in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Failed,
    /// The node was deleted while the call was in flight.
    NodeGone,
}

#[derive(Debug, Clone)]
pub struct ConversationTree {
    handle: Option<ConversationId>,
    /// Ids in creation order.
    order: Vec<String>,
    nodes_by_id: HashMap<String, Node>,
    seq: u64,
    generating: HashSet<String>,
    title: String,
    title_generated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationTree {
    /// Fresh tree holding only the root system node.
    pub fn initialize(handle: Option<ConversationId>) -> Self {
        Self::initialize_at(handle, Utc::now())
    }

    pub fn initialize_at(handle: Option<ConversationId>, now: DateTime<Utc>) -> Self {
        let mut tree = Self {
            handle,
            order: Vec::new(),
            nodes_by_id: HashMap::new(),
            seq: 0,
            generating: HashSet::new(),
            title: String::new(),
            title_generated: false,
            created_at: now,
            updated_at: now,
        };
        tree.insert_node(NodeType::System, None);
        tree
    }

    pub(super) fn from_parts(
        handle: Option<ConversationId>,
        nodes: Vec<Node>,
        seq: u64,
        title: String,
        title_generated: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let order = nodes.iter().map(|n| n.id.clone()).collect();
        let nodes_by_id = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self {
            handle,
            order,
            nodes_by_id,
            seq,
            generating: HashSet::new(),
            title,
            title_generated,
            created_at,
            updated_at,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn handle(&self) -> Option<&ConversationId> {
        self.handle.as_ref()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes_by_id.get(id)
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().filter_map(|id| self.nodes_by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes_by_id.contains_key(id)
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes().find(|n| n.is_root())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn title_generated(&self) -> bool {
        self.title_generated
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_generating(&self, id: &str) -> bool {
        self.generating.contains(id)
    }

    pub fn generating_nodes(&self) -> impl Iterator<Item = &str> + '_ {
        self.generating.iter().map(String::as_str)
    }

    /// True when `id` is a user node still waiting for its single llm answer.
    pub fn can_add_llm_child(&self, id: &str) -> bool {
        self.node(id)
            .is_some_and(|n| n.node_type == NodeType::User && n.children.is_empty())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set_handle(&mut self, handle: ConversationId) {
        self.handle = Some(handle);
    }

    /// Stamp `updated_at`; called right before a record is written.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn add_child(
        &mut self,
        parent_id: &str,
        child_type: NodeType,
    ) -> Result<Applied<String>, TreeError> {
        let parent = self
            .node(parent_id)
            .ok_or_else(|| TreeError::not_found(format!("Parent node {parent_id} not found")))?;

        let (allowed, max_children) = parent.node_type.child_rule();
        if child_type != allowed {
            return Err(TreeError::invalid_structure(format!(
                "Node type {} can only have {} children",
                parent.node_type, allowed
            )));
        }
        if let Some(max) = max_children {
            if parent.children.len() >= max {
                return Err(TreeError::invalid_structure(format!(
                    "Node {parent_id} already has a child ({} nodes can only have one {} child)",
                    parent.node_type, allowed
                )));
            }
        }

        let id = self.insert_node(child_type, Some(parent_id.to_string()));
        if let Some(parent) = self.nodes_by_id.get_mut(parent_id) {
            parent.children.push(id.clone());
        }
        log::debug!("Added {} node {} under {}", child_type, id, parent_id);

        Ok(Applied::new(id, self.autosave_effects()))
    }

    pub fn update_text(&mut self, node_id: &str, text: &str) -> Result<Applied<()>, TreeError> {
        let node = self
            .nodes_by_id
            .get_mut(node_id)
            .ok_or_else(|| TreeError::not_found(format!("Node {node_id} not found")))?;
        node.text = text.to_string();
        Ok(Applied::new((), self.autosave_effects()))
    }

    /// Remove `node_id` and its whole subtree.
    ///
    /// Returns the removed ids, descendants before ancestors.
    pub fn delete_node(&mut self, node_id: &str) -> Result<Applied<Vec<String>>, TreeError> {
        let node = self
            .node(node_id)
            .ok_or_else(|| TreeError::not_found(format!("Node {node_id} not found")))?;
        if node.is_root() {
            return Err(TreeError::protected_root("The root system node cannot be deleted"));
        }
        let parent_id = node.parent_id.clone();

        let removed = self.subtree_post_order(node_id);

        if let Some(parent) = parent_id.and_then(|pid| self.nodes_by_id.get_mut(&pid)) {
            parent.children.retain(|c| c != node_id);
        }
        let removed_set: HashSet<&str> = removed.iter().map(String::as_str).collect();
        self.order.retain(|id| !removed_set.contains(id.as_str()));
        for id in &removed {
            self.nodes_by_id.remove(id);
            self.generating.remove(id);
        }
        log::debug!("Deleted node {} ({} nodes removed)", node_id, removed.len());

        Ok(Applied::new(removed, self.autosave_effects()))
    }

    /// Reserve `node_id` for one completion call and return its context.
    pub fn begin_generation(&mut self, node_id: &str) -> Result<Vec<ChatMessage>, TreeError> {
        let node = self
            .node(node_id)
            .ok_or_else(|| TreeError::not_found(format!("Node {node_id} not found")))?;
        if node.node_type != NodeType::Llm {
            return Err(TreeError::wrong_node_type(format!(
                "Node {node_id} is a {} node; only llm nodes can be generated",
                node.node_type
            )));
        }
        if self.generating.contains(node_id) {
            return Err(TreeError::already_generating(format!(
                "Node {node_id} already has a generation in flight"
            )));
        }

        let messages = self.build_messages_from_tree(node_id);
        self.generating.insert(node_id.to_string());
        Ok(messages)
    }

    /// Release `node_id` from generating status without touching its text.
    pub fn release_generation(&mut self, node_id: &str) -> bool {
        self.generating.remove(node_id)
    }

    /// Record the end of a generation call started with [`Self::begin_generation`].
    pub fn finish_generation(
        &mut self,
        node_id: &str,
        result: Result<&str, &AiError>,
    ) -> Applied<GenerationOutcome> {
        self.generating.remove(node_id);

        let Some(node) = self.nodes_by_id.get_mut(node_id) else {
            log::warn!("Generation result for deleted node {} dropped", node_id);
            return Applied::new(GenerationOutcome::NodeGone, Effects::new());
        };

        let outcome = match result {
            Ok(content) => {
                node.text = content.to_string();
                GenerationOutcome::Completed
            }
            Err(err) => {
                node.text = prompts::generation_error_marker(err.message());
                GenerationOutcome::Failed
            }
        };

        let mut effects = self.autosave_effects();
        if outcome == GenerationOutcome::Completed && !self.title_generated {
            effects.push(Effect::GenerateTitle);
        }
        Applied::new(outcome, effects)
    }

    /// Store a generated title. No-op once a title has been generated.
    pub fn apply_title(&mut self, title: &str) -> Applied<bool> {
        if self.title_generated {
            return Applied::new(false, Effects::new());
        }
        let title = truncate_title(title);
        if title.is_empty() {
            return Applied::new(false, Effects::new());
        }
        self.title = title;
        self.title_generated = true;
        Applied::new(true, self.autosave_effects())
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Ids on the root-to-`target` path, root first. Empty when unreachable.
    pub fn path_to(&self, target: &str) -> Vec<String> {
        let Some(root) = self.root() else {
            return Vec::new();
        };

        // Iterative DFS over children in insertion order; first match wins.
        let mut came_from: HashMap<&str, &str> = HashMap::new();
        let mut stack: Vec<&str> = vec![root.id.as_str()];
        let mut visited: HashSet<&str> = HashSet::new();
        let mut found = false;
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if id == target {
                found = true;
                break;
            }
            let Some(node) = self.node(id) else {
                continue;
            };
            for child in node.children.iter().rev() {
                if !visited.contains(child.as_str()) {
                    came_from.entry(child.as_str()).or_insert(id);
                    stack.push(child.as_str());
                }
            }
        }
        if !found {
            return Vec::new();
        }

        let mut path = vec![target.to_string()];
        let mut cursor = target;
        while let Some(&parent) = came_from.get(cursor) {
            path.push(parent.to_string());
            cursor = parent;
        }
        path.reverse();
        path
    }

    /// Model input for generating `target_id`: the root-to-target path as
    /// role-tagged messages, excluding the target when it is an llm node.
    pub fn build_messages_from_tree(&self, target_id: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for id in self.path_to(target_id) {
            let Some(node) = self.node(&id) else {
                continue;
            };
            match node.node_type {
                NodeType::System => {
                    let text = if node.text.trim().is_empty() {
                        prompts::SYSTEM_PROMPT_FALLBACK
                    } else {
                        node.text.as_str()
                    };
                    messages.push(ChatMessage::system(text));
                }
                NodeType::User => messages.push(ChatMessage::user(node.text.clone())),
                NodeType::Llm if id == target_id => {}
                NodeType::Llm => messages.push(ChatMessage::assistant(node.text.clone())),
            }
        }
        messages
    }

    /// Every node's role-tagged text in creation order, for naming the conversation.
    ///
    /// `None` once a title has been generated.
    pub fn title_transcript(&self) -> Option<String> {
        if self.title_generated {
            return None;
        }
        let mut out = String::new();
        for node in self.nodes() {
            out.push_str(node.node_type.role().as_str());
            out.push_str(": ");
            out.push_str(node.text.trim());
            out.push('\n');
        }
        Some(out)
    }

    /// Check every structural rule; used on loaded data and in tests.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.order.len() != self.nodes_by_id.len() {
            return Err(TreeError::corrupt(format!(
                "Node list has {} entries but the index has {}",
                self.order.len(),
                self.nodes_by_id.len()
            )));
        }
        let mut seen = HashSet::new();
        for id in &self.order {
            if !seen.insert(id.as_str()) {
                return Err(TreeError::corrupt(format!("Duplicate node id {id}")));
            }
            if !self.nodes_by_id.contains_key(id) {
                return Err(TreeError::corrupt(format!("Node {id} missing from index")));
            }
        }

        let mut root_id: Option<&str> = None;
        for node in self.nodes() {
            match (&node.parent_id, node.node_type) {
                (None, NodeType::System) => {
                    if let Some(existing) = root_id {
                        return Err(TreeError::corrupt(format!(
                            "Multiple root nodes: {existing} and {}",
                            node.id
                        )));
                    }
                    root_id = Some(node.id.as_str());
                }
                (None, other) => {
                    return Err(TreeError::corrupt(format!(
                        "Node {} ({other}) has no parent",
                        node.id
                    )));
                }
                (Some(_), NodeType::System) => {
                    return Err(TreeError::corrupt(format!(
                        "System node {} must be the root",
                        node.id
                    )));
                }
                (Some(parent_id), _) => {
                    let parent = self.node(parent_id).ok_or_else(|| {
                        TreeError::corrupt(format!(
                            "Node {} references missing parent {parent_id}",
                            node.id
                        ))
                    })?;
                    let occurrences = parent.children.iter().filter(|c| **c == node.id).count();
                    if occurrences != 1 {
                        return Err(TreeError::corrupt(format!(
                            "Parent {parent_id} lists child {} {occurrences} times",
                            node.id
                        )));
                    }
                }
            }

            let (allowed, max_children) = node.node_type.child_rule();
            if max_children.is_some_and(|max| node.children.len() > max) {
                return Err(TreeError::corrupt(format!(
                    "Node {} has {} children",
                    node.id,
                    node.children.len()
                )));
            }
            for child_id in &node.children {
                let child = self.node(child_id).ok_or_else(|| {
                    TreeError::corrupt(format!("Node {} lists missing child {child_id}", node.id))
                })?;
                if child.parent_id.as_deref() != Some(node.id.as_str()) {
                    return Err(TreeError::corrupt(format!(
                        "Child {child_id} does not point back to {}",
                        node.id
                    )));
                }
                if child.node_type != allowed {
                    return Err(TreeError::corrupt(format!(
                        "Node {} ({}) cannot have {} child {child_id}",
                        node.id, node.node_type, child.node_type
                    )));
                }
            }
        }

        let root_id = root_id.ok_or_else(|| TreeError::corrupt("Conversation has no root node"))?;
        let reachable = self.subtree_post_order(root_id).len();
        if reachable != self.order.len() {
            return Err(TreeError::corrupt(format!(
                "{} nodes are not reachable from the root",
                self.order.len() - reachable
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_node(&mut self, node_type: NodeType, parent_id: Option<String>) -> String {
        let id = node_id(self.seq);
        self.seq += 1;
        let node = Node {
            id: id.clone(),
            node_type,
            parent_id,
            children: Vec::new(),
            text: node_type.placeholder().to_string(),
        };
        self.order.push(id.clone());
        self.nodes_by_id.insert(id.clone(), node);
        id
    }

    fn autosave_effects(&self) -> Effects {
        let mut effects = Effects::new();
        if self.handle.is_some() {
            effects.push(Effect::Persist);
        }
        effects
    }

    /// `start` and all descendants, children before parents.
    fn subtree_post_order(&self, start: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        // (id, children already pushed)
        let mut stack: Vec<(&str, bool)> = vec![(start, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id.to_string());
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(node) = self.node(id) {
                for child in node.children.iter().rev() {
                    if !visited.contains(child.as_str()) {
                        stack.push((child.as_str(), false));
                    }
                }
            }
        }
        out
    }
}

fn truncate_title(source: &str) -> String {
    let first_line = source.lines().next().unwrap_or(source).trim();
    if first_line.chars().count() <= prompts::TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    first_line
        .chars()
        .take(prompts::TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
        + "…"
}
