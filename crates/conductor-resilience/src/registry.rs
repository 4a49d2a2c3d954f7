use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use conductor_core::{Clock, CoreError, EventSink, validate_id};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, HealthProbe,
};

/// The breakers of a process, one per guarded dependency id.
///
/// All breakers share the registry's clock and event sink.
pub struct CircuitBreakerRegistry {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("dependencies", &self.dependency_ids())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            clock,
            sink,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register one breaker per configured dependency, asking `probe_for`
    /// for each dependency's health probe.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency id is not a valid stream id.
    pub fn from_config<F>(
        configs: &BTreeMap<String, CircuitBreakerConfig>,
        mut probe_for: F,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, CoreError>
    where
        F: FnMut(&str) -> Arc<dyn HealthProbe>,
    {
        let registry = Self::new(clock, sink);
        for (dependency_id, config) in configs {
            let probe = probe_for(dependency_id);
            registry.register(dependency_id.clone(), *config, probe)?;
        }
        Ok(registry)
    }

    /// Create a closed breaker for `dependency_id`, replacing any existing
    /// one.
    ///
    /// # Errors
    ///
    /// Returns an error if `dependency_id` is not a valid stream id.
    pub fn register(
        &self,
        dependency_id: impl Into<String>,
        config: CircuitBreakerConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Arc<CircuitBreaker>, CoreError> {
        let dependency_id = dependency_id.into();
        validate_id("dependency id", &dependency_id)?;
        let breaker = CircuitBreaker::with_sink(
            dependency_id.clone(),
            config,
            Arc::clone(&self.clock),
            probe,
            Arc::clone(&self.sink),
        );
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dependency_id, Arc::clone(&breaker));
        Ok(breaker)
    }

    #[must_use]
    pub fn get(&self, dependency_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency_id)
            .cloned()
    }

    #[must_use]
    pub fn dependency_ids(&self) -> Vec<String> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Current state of every breaker, ordered by dependency id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }
}
