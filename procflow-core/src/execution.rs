//! The execution tree: mutable runtime tokens positioned on the graph.
//!
//! Executions live in an arena addressed by id, with parent/child links
//! stored as ids rather than object references. The whole arena serializes,
//! so a persistence collaborator can snapshot an instance at any suspension
//! point and a different worker can pick it up later.

use crate::error::EngineError;
use crate::listener::EventSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One runtime token.
///
/// Invariants: exactly one root per process instance; every non-root has
/// exactly one parent; a concurrent non-scope execution's parent is the
/// concurrent root grouping the sibling tokens of a fork.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    /// Ordered children.
    pub children: Vec<ExecutionId>,
    pub activity: Option<String>,
    /// Set only while mid-transition.
    pub transition: Option<String>,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    /// Replay cursor for the listener notification protocol.
    pub listener_index: usize,
    /// Transient, set only during listener notification.
    pub event_name: Option<String>,
    pub event_source: Option<EventSource>,
    /// Remaining entry stack while positioning the process-start token.
    pub start_stack: Vec<String>,
    /// Scope-local variables.
    pub variables: HashMap<String, serde_json::Value>,
}

impl ExecutionRecord {
    fn new(id: ExecutionId, parent: Option<ExecutionId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            activity: None,
            transition: None,
            is_active: true,
            is_concurrent: false,
            is_scope: false,
            listener_index: 0,
            event_name: None,
            event_source: None,
            start_stack: Vec::new(),
            variables: HashMap::new(),
        }
    }
}

/// All executions of one process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionArena {
    pub process_instance_id: Uuid,
    pub definition_id: String,
    /// Set when the instance has run to completion.
    pub ended: bool,
    root: ExecutionId,
    records: HashMap<ExecutionId, ExecutionRecord>,
}

impl ExecutionArena {
    /// New instance: a single root execution, which is itself a scope.
    pub fn new(definition_id: impl Into<String>) -> Self {
        let root_id = ExecutionId::new();
        let mut root = ExecutionRecord::new(root_id, None);
        root.is_scope = true;
        let mut records = HashMap::new();
        records.insert(root_id, root);
        Self {
            process_instance_id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            ended: false,
            root: root_id,
            records,
        }
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&ExecutionRecord, EngineError> {
        self.records
            .get(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut ExecutionRecord, EngineError> {
        self.records
            .get_mut(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        concurrent: bool,
        scope: bool,
    ) -> Result<ExecutionId, EngineError> {
        let id = ExecutionId::new();
        let mut child = ExecutionRecord::new(id, Some(parent));
        child.is_concurrent = concurrent;
        child.is_scope = scope;
        self.get_mut(parent)?.children.push(id);
        self.records.insert(id, child);
        Ok(id)
    }

    /// Remove an execution and its whole subtree, detaching it from its
    /// parent's child list.
    pub fn remove_subtree(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let parent = self.get(id)?.parent;
        if let Some(p) = parent {
            if let Some(prec) = self.records.get_mut(&p) {
                prec.children.retain(|c| *c != id);
            }
        }
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(rec) = self.records.remove(&next) {
                stack.extend(rec.children);
            }
        }
        Ok(())
    }

    /// Relocate an execution one level up: out of its concurrent root's
    /// child list and into the grandparent's. Used when a concurrent
    /// non-scope token crosses a scope boundary.
    pub fn move_up(&mut self, id: ExecutionId) -> Result<ExecutionId, EngineError> {
        let parent = self
            .get(id)?
            .parent
            .ok_or(EngineError::UnknownExecution(id))?;
        let grandparent = self
            .get(parent)?
            .parent
            .ok_or(EngineError::UnknownExecution(parent))?;
        self.get_mut(parent)?.children.retain(|c| *c != id);
        self.get_mut(grandparent)?.children.push(id);
        let rec = self.get_mut(id)?;
        rec.parent = Some(grandparent);
        rec.is_concurrent = false;
        Ok(grandparent)
    }

    /// Collapse a degenerate single-child fork.
    ///
    /// If the concurrent root has exactly one remaining concurrent child:
    /// a scoped child is converted in place (stops being concurrent), a
    /// plain child has its state folded into the root and is deleted. The
    /// tree never retains a single-child fork. Returns the id of a deleted
    /// child so callers can redirect pending work at it to the root.
    pub fn prune_degenerate_fork(
        &mut self,
        root: ExecutionId,
    ) -> Result<Option<ExecutionId>, EngineError> {
        let Some(rec) = self.records.get(&root) else {
            return Ok(None);
        };
        if rec.children.len() != 1 {
            return Ok(None);
        }
        let sole = rec.children[0];
        let sole_rec = self.get(sole)?;
        if !sole_rec.is_concurrent {
            return Ok(None);
        }
        if sole_rec.is_scope {
            self.get_mut(sole)?.is_concurrent = false;
            return Ok(None);
        }
        let folded = self.get(sole)?.clone();
        let root_rec = self.get_mut(root)?;
        root_rec.activity = folded.activity;
        root_rec.transition = folded.transition;
        root_rec.is_active = folded.is_active;
        root_rec.listener_index = folded.listener_index;
        root_rec.variables.extend(folded.variables);
        self.remove_subtree(sole)?;
        Ok(Some(sole))
    }

    /// Parent absorbs the child's activity/transition pointers; the child is
    /// destroyed and removed. Used when a non-concurrent scoped execution
    /// leaves its scope.
    pub fn absorb_child(
        &mut self,
        parent: ExecutionId,
        child: ExecutionId,
    ) -> Result<(), EngineError> {
        let (activity, transition, active, cursor) = {
            let c = self.get(child)?;
            (
                c.activity.clone(),
                c.transition.clone(),
                c.is_active,
                c.listener_index,
            )
        };
        let p = self.get_mut(parent)?;
        p.activity = activity;
        p.transition = transition;
        p.is_active = active;
        p.listener_index = cursor;
        self.remove_subtree(child)
    }

    /// Tear down a concurrent scoped execution in place: its scope state is
    /// destroyed but the token stays under the same parent (the tree is
    /// already minimal).
    pub fn destroy_scope_in_place(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        let rec = self.get_mut(id)?;
        rec.variables.clear();
        rec.is_scope = false;
        Ok(())
    }

    // ── Variables ──

    /// Set a variable on the nearest enclosing scope execution (including
    /// the execution itself when scoped).
    pub fn set_variable(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut cursor = id;
        loop {
            let rec = self.get(cursor)?;
            if rec.is_scope {
                break;
            }
            match rec.parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        self.get_mut(cursor)?.variables.insert(name.into(), value);
        Ok(())
    }

    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.get_mut(id)?.variables.insert(name.into(), value);
        Ok(())
    }

    pub fn get_variable(
        &self,
        id: ExecutionId,
        name: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let rec = self.get(c)?;
            if let Some(v) = rec.variables.get(name) {
                return Ok(Some(v.clone()));
            }
            cursor = rec.parent;
        }
        Ok(None)
    }

    /// Merged variable view from the root down to this execution; inner
    /// scopes shadow outer ones.
    pub fn collect_variables(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<String, serde_json::Value>, EngineError> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            chain.push(c);
            cursor = self.get(c)?.parent;
        }
        let mut merged = HashMap::new();
        for c in chain.into_iter().rev() {
            let rec = self.get(c)?;
            for (k, v) in &rec.variables {
                merged.insert(k.clone(), v.clone());
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variables_shadow_outward_in() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let child = arena.create_child(root, false, true).unwrap();
        arena.set_variable_local(root, "x", json!(1)).unwrap();
        arena.set_variable_local(root, "y", json!("outer")).unwrap();
        arena.set_variable_local(child, "y", json!("inner")).unwrap();

        let merged = arena.collect_variables(child).unwrap();
        assert_eq!(merged["x"], json!(1));
        assert_eq!(merged["y"], json!("inner"));
        // Non-scope child writes land on the nearest scope.
        let leaf = arena.create_child(child, true, false).unwrap();
        arena.set_variable(leaf, "z", json!(true)).unwrap();
        assert!(arena.get(child).unwrap().variables.contains_key("z"));
        assert!(!arena.get(leaf).unwrap().variables.contains_key("z"));
    }

    #[test]
    fn prune_folds_plain_child_into_root() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let a = arena.create_child(root, true, false).unwrap();
        let b = arena.create_child(root, true, false).unwrap();
        arena.get_mut(a).unwrap().activity = Some("left".into());
        arena.get_mut(b).unwrap().activity = Some("right".into());

        // One branch leaves the fork; the survivor folds into the root.
        arena.remove_subtree(a).unwrap();
        let folded = arena.prune_degenerate_fork(root).unwrap();

        assert_eq!(folded, Some(b));
        assert_eq!(arena.len(), 1);
        let root_rec = arena.get(root).unwrap();
        assert_eq!(root_rec.activity.as_deref(), Some("right"));
        assert!(root_rec.children.is_empty());
    }

    #[test]
    fn prune_converts_scoped_child_in_place() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let a = arena.create_child(root, true, false).unwrap();
        let b = arena.create_child(root, true, true).unwrap();
        arena.remove_subtree(a).unwrap();
        assert_eq!(arena.prune_degenerate_fork(root).unwrap(), None);

        // Scoped survivor stays as a child but stops being concurrent.
        assert!(arena.contains(b));
        let b_rec = arena.get(b).unwrap();
        assert!(!b_rec.is_concurrent);
        assert!(b_rec.is_scope);
    }

    #[test]
    fn move_up_relocates_to_grandparent() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let fork_root = arena.create_child(root, false, true).unwrap();
        let token = arena.create_child(fork_root, true, false).unwrap();

        let grandparent = arena.move_up(token).unwrap();
        assert_eq!(grandparent, root);
        assert_eq!(arena.get(token).unwrap().parent, Some(root));
        assert!(arena.get(root).unwrap().children.contains(&token));
        assert!(!arena.get(fork_root).unwrap().children.contains(&token));
    }

    #[test]
    fn absorb_takes_pointers_and_drops_child() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        let child = arena.create_child(root, false, true).unwrap();
        {
            let c = arena.get_mut(child).unwrap();
            c.activity = Some("inner".into());
            c.transition = Some("t9".into());
        }
        arena.absorb_child(root, child).unwrap();
        assert!(!arena.contains(child));
        let r = arena.get(root).unwrap();
        assert_eq!(r.activity.as_deref(), Some("inner"));
        assert_eq!(r.transition.as_deref(), Some("t9"));
    }

    #[test]
    fn arena_round_trips_through_serde() {
        let mut arena = ExecutionArena::new("p");
        let root = arena.root();
        arena.set_variable_local(root, "k", json!([1, 2])).unwrap();
        let json = serde_json::to_string(&arena).unwrap();
        let back: ExecutionArena = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root(), root);
        assert_eq!(
            back.get_variable(root, "k").unwrap(),
            Some(json!([1, 2]))
        );
    }
}
