use crate::net::buffer::WriteBuffer;
use crate::net::support::Fault;
use lumen::config::Profile;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// External producer of write buffers, polled by the write pipeline. The
/// connection reports per-request progress back through the same contract.
/// Callbacks identify the connection by its registry identifier.
pub trait ConnectionDataSource {
    fn has_data(&mut self, connection: &str) -> bool;
    fn next_request_identifier(&mut self, connection: &str) -> String;
    fn request_data(&mut self, connection: &str, request: &str) -> WriteBuffer;

    /// Delivered exactly once per buffer, when its bytes begin flowing.
    fn processing_started(&mut self, connection: &str, request: &str);
    /// Delivered once the buffer has been fully shipped.
    fn did_send_request(&mut self, connection: &str, request: &str);
    /// Delivered when a mid-write error terminates the request.
    fn did_fail_to_process_request(&mut self, connection: &str, request: &str);
}

/// External subscriber to connection lifecycle events. Exactly one callback
/// fires per lifecycle event.
pub trait ConnectionDelegate {
    fn did_connect_to_host(&mut self, host: &str);
    fn did_disconnect_from_host(&mut self, host: &str);
    fn will_disconnect_from_host(&mut self, host: &str, fault: &Fault);
    fn connection_did_fail_to_host(&mut self, host: &str, fault: &Fault);
}

pub type DataSourceHandle = Rc<RefCell<dyn ConnectionDataSource>>;
pub type DelegateHandle = Rc<RefCell<dyn ConnectionDelegate>>;
type WeakDelegate = Weak<RefCell<dyn ConnectionDelegate>>;

/// The currently interested lifecycle subscribers. Entries are weak; a
/// subscriber that went away is dropped silently at dispatch time. The
/// handheld profile broadcasts to an ordered list, the desktop profile keeps
/// a single slot.
pub struct DelegateSet {
    profile: Profile,
    entries: Vec<WeakDelegate>,
}

impl DelegateSet {
    #[inline]
    pub fn new(profile: Profile) -> DelegateSet {
        DelegateSet {
            profile,
            entries: Vec::new(),
        }
    }

    /// Registers a delegate. On the desktop profile the new delegate
    /// replaces the previous one.
    pub fn assign(&mut self, delegate: &DelegateHandle) {
        match self.profile {
            Profile::Handheld => self.entries.push(Rc::downgrade(delegate)),
            Profile::Desktop => {
                self.entries.clear();
                self.entries.push(Rc::downgrade(delegate));
            }
        }
    }

    /// Removes a delegate. On the desktop profile the slot is cleared only
    /// when it holds this delegate.
    pub fn resign(&mut self, delegate: &DelegateHandle) {
        let target = Rc::downgrade(delegate);

        self.entries.retain(|entry| !entry.ptr_eq(&target));
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Notifies every currently-live delegate in registration order. The
    /// snapshot taken up front keeps a delegate dropping itself during its
    /// own callback from disturbing the remaining broadcast.
    pub fn broadcast<F: FnMut(&mut dyn ConnectionDelegate)>(&mut self, mut notify: F) {
        let live: Vec<DelegateHandle> = self.entries.iter().filter_map(Weak::upgrade).collect();

        self.entries.retain(|entry| entry.strong_count() > 0);

        for delegate in live {
            notify(&mut *delegate.borrow_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        connects: Vec<String>,
    }

    impl ConnectionDelegate for Recorder {
        fn did_connect_to_host(&mut self, host: &str) {
            self.connects.push(host.to_string());
        }

        fn did_disconnect_from_host(&mut self, _host: &str) {}

        fn will_disconnect_from_host(&mut self, _host: &str, _fault: &Fault) {}

        fn connection_did_fail_to_host(&mut self, _host: &str, _fault: &Fault) {}
    }

    fn recorder() -> (Rc<RefCell<Recorder>>, DelegateHandle) {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let handle: DelegateHandle = recorder.clone();

        (recorder, handle)
    }

    #[test]
    fn test_handheld_broadcasts_in_registration_order() {
        let mut set = DelegateSet::new(Profile::Handheld);
        let (first, first_handle) = recorder();
        let (second, second_handle) = recorder();

        set.assign(&first_handle);
        set.assign(&second_handle);

        let mut order = 0;
        set.broadcast(|delegate| {
            order += 1;
            delegate.did_connect_to_host(&format!("origin-{}", order));
        });

        assert_eq!(first.borrow().connects, vec!["origin-1"]);
        assert_eq!(second.borrow().connects, vec!["origin-2"]);
    }

    #[test]
    fn test_desktop_keeps_single_delegate() {
        let mut set = DelegateSet::new(Profile::Desktop);
        let (first, first_handle) = recorder();
        let (second, second_handle) = recorder();

        set.assign(&first_handle);
        set.assign(&second_handle);

        set.broadcast(|delegate| delegate.did_connect_to_host("origin"));

        assert!(first.borrow().connects.is_empty());
        assert_eq!(second.borrow().connects, vec!["origin"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_stale_delegates_dropped_silently() {
        let mut set = DelegateSet::new(Profile::Handheld);
        let (first, first_handle) = recorder();

        set.assign(&first_handle);

        {
            let (_, transient_handle) = recorder();
            set.assign(&transient_handle);
        }

        set.broadcast(|delegate| delegate.did_connect_to_host("origin"));

        assert_eq!(first.borrow().connects, vec!["origin"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_resign() {
        let mut set = DelegateSet::new(Profile::Handheld);
        let (first, first_handle) = recorder();
        let (second, second_handle) = recorder();

        set.assign(&first_handle);
        set.assign(&second_handle);
        set.resign(&first_handle);

        set.broadcast(|delegate| delegate.did_connect_to_host("origin"));

        assert!(first.borrow().connects.is_empty());
        assert_eq!(second.borrow().connects, vec!["origin"]);
    }

    #[test]
    fn test_duplicate_assignment_notified_twice() {
        let mut set = DelegateSet::new(Profile::Handheld);
        let (first, first_handle) = recorder();

        set.assign(&first_handle);
        set.assign(&first_handle);

        set.broadcast(|delegate| delegate.did_connect_to_host("origin"));

        assert_eq!(first.borrow().connects.len(), 2);
    }
}
