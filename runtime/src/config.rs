//! Configuration of a hooked collection and of individual calls.

use collection_hooks_core::InvocationId;

use crate::abort::AbortSignal;

/// Default number of per-record sub-invocations run concurrently in
/// unordered mode.
pub const DEFAULT_HOOK_BATCH_SIZE: usize = 1000;

/// Collection-wide settings.
///
/// # Example
///
/// ```
/// use collection_hooks_runtime::config::HooksConfig;
///
/// let config = HooksConfig::default()
///     .with_default_ordered(false)
///     .with_default_hook_batch_size(0);
///
/// assert!(!config.default_ordered());
/// assert_eq!(config.default_hook_batch_size(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HooksConfig {
    default_ordered: bool,
    default_hook_batch_size: usize,
    emit_wildcard: bool,
    namespace: Option<String>,
}

impl HooksConfig {
    /// Whether per-record fan-out runs sequentially unless a call says otherwise.
    #[must_use]
    pub const fn default_ordered(&self) -> bool {
        self.default_ordered
    }

    /// Concurrency of unordered fan-out unless a call says otherwise.
    #[must_use]
    pub const fn default_hook_batch_size(&self) -> usize {
        self.default_hook_batch_size
    }

    /// Whether `*` listeners take part in every invocation.
    #[must_use]
    pub const fn emit_wildcard(&self) -> bool {
        self.emit_wildcard
    }

    /// `thisArg` override; the store's namespace is used when unset.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Set the default fan-out ordering.
    #[must_use]
    pub const fn with_default_ordered(mut self, ordered: bool) -> Self {
        self.default_ordered = ordered;
        self
    }

    /// Set the default unordered batch size (at least 1).
    #[must_use]
    pub const fn with_default_hook_batch_size(mut self, size: usize) -> Self {
        self.default_hook_batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Enable or disable wildcard listeners.
    #[must_use]
    pub const fn with_emit_wildcard(mut self, emit_wildcard: bool) -> Self {
        self.emit_wildcard = emit_wildcard;
        self
    }

    /// Override the `thisArg` handed to listeners.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            default_ordered: true,
            default_hook_batch_size: DEFAULT_HOOK_BATCH_SIZE,
            emit_wildcard: true,
            namespace: None,
        }
    }
}

/// Per-call settings.
///
/// Unset fields fall back to the collection's [`HooksConfig`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Run per-record sub-invocations one at a time
    pub ordered: Option<bool>,
    /// Concurrency of unordered fan-out
    pub hook_batch_size: Option<usize>,
    /// Cancellation for fan-out and document fetches
    pub signal: Option<AbortSignal>,
    /// Invocation that caused this call, for calls made from inside a listener
    pub parent_invocation: Option<InvocationId>,
}

impl CallOptions {
    /// Force ordered or unordered fan-out.
    #[must_use]
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    /// Set the unordered batch size.
    #[must_use]
    pub fn hook_batch_size(mut self, size: usize) -> Self {
        self.hook_batch_size = Some(size);
        self
    }

    /// Attach a cancellation signal.
    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Record `parent` as the cause of this call.
    #[must_use]
    pub fn parent(mut self, parent: InvocationId) -> Self {
        self.parent_invocation = Some(parent);
        self
    }

    pub(crate) fn resolve_ordered(&self, config: &HooksConfig) -> bool {
        self.ordered.unwrap_or(config.default_ordered)
    }

    pub(crate) fn resolve_batch_size(&self, config: &HooksConfig) -> usize {
        self.hook_batch_size
            .unwrap_or(config.default_hook_batch_size)
            .max(1)
    }

    pub(crate) fn resolve_signal(&self) -> AbortSignal {
        self.signal.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HooksConfig::default();
        assert!(config.default_ordered());
        assert_eq!(config.default_hook_batch_size(), DEFAULT_HOOK_BATCH_SIZE);
        assert!(config.emit_wildcard());
        assert_eq!(config.namespace(), None);
    }

    #[test]
    fn test_call_options_fall_back_to_config() {
        let config = HooksConfig::default().with_default_ordered(false);
        let call = CallOptions::default();
        assert!(!call.resolve_ordered(&config));
        assert_eq!(call.resolve_batch_size(&config), DEFAULT_HOOK_BATCH_SIZE);

        let call = CallOptions::default().ordered(true).hook_batch_size(0);
        assert!(call.resolve_ordered(&config));
        assert_eq!(call.resolve_batch_size(&config), 1);
    }
}
