/// Ambient context for one kernel invocation.
///
/// Carries the originating actor identity and (optionally) the process
/// definition the current command runs against. Threaded explicitly through
/// every call that needs it — operations may suspend and resume on a
/// different worker, so nothing here may rely on thread affinity.
#[derive(Clone, Debug, Default)]
pub struct CommandContext {
    pub actor: Option<String>,
    pub definition_id: Option<String>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_definition(mut self, definition_id: impl Into<String>) -> Self {
        self.definition_id = Some(definition_id.into());
        self
    }
}
