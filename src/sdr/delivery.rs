//! Delivery of converted buffers to the host callback

/// Receiver of converted sample buffers.
///
/// Called synchronously on the acquisition thread, once per buffer. The
/// slice is only valid for the duration of the call. `dropped` is the
/// number of samples the driver lost between the previous buffer and this
/// one.
pub trait SampleCallback: Send {
    fn on_samples(&mut self, samples: &[f32], dropped: u64);
}

impl<F> SampleCallback for F
where
    F: FnMut(&[f32], u64) + Send,
{
    fn on_samples(&mut self, samples: &[f32], dropped: u64) {
        self(samples, dropped)
    }
}

/// Host function plus the opaque context it was registered with
pub struct ContextCallback<C: Send> {
    func: fn(&[f32], &mut C, u64),
    context: C,
}

impl<C: Send> ContextCallback<C> {
    pub fn new(func: fn(&[f32], &mut C, u64), context: C) -> Self {
        Self { func, context }
    }

    pub fn into_context(self) -> C {
        self.context
    }
}

impl<C: Send> SampleCallback for ContextCallback<C> {
    fn on_samples(&mut self, samples: &[f32], dropped: u64) {
        (self.func)(samples, &mut self.context, dropped)
    }
}

/// The single registered callback. No queuing: `deliver` returns once the
/// host callback has.
pub struct Delivery {
    callback: Box<dyn SampleCallback>,
    delivered: u64,
}

impl Delivery {
    pub fn new(callback: Box<dyn SampleCallback>) -> Self {
        Self {
            callback,
            delivered: 0,
        }
    }

    pub fn deliver(&mut self, samples: &[f32], dropped: u64) {
        self.callback.on_samples(samples, dropped);
        self.delivered += 1;
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}
