use tokio::sync::watch;

/// Single-fire readiness signal.
///
/// A gate is fired at most once. Resetting a gate means replacing it with a
/// fresh one: the old sender is dropped, which wakes anyone still waiting on
/// it so they can pick up the replacement.
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A gate that is already fired.
    pub fn fired() -> Self {
        let gate = Self::new();
        gate.fire();
        gate
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fire the gate. Returns false if it had already been fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
