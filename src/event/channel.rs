use crossbeam::channel::{unbounded, Receiver, Sender};

pub struct EventConsumer<E>(Receiver<E>);
pub struct EventPublisher<E>(Sender<E>);

pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    /// Publishing never blocks; events for a consumer that has gone away are
    /// silently dropped (the child may outlive its logger for a moment
    /// during shutdown).
    pub fn publish(&self, event: E) {
        let _ = self.0.send(event);
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> EventConsumer<E> {
    pub fn iter(&self) -> impl Iterator<Item = E> + '_ {
        self.0.iter()
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}
