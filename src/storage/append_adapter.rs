// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use crate::raft::{IndexedEntry, RaftAppendListener, RaftCommitListener};
use crate::utils::ListenerSet;
use crate::AppError;

use super::{AppendListener, CommitListener, WriteListener};

/// Translates the raft callbacks of one append into [`AppendListener`] calls and
/// broadcasts the write to the storage's write listeners.
pub(super) struct AppendListenerAdapter {
    delegate: Arc<dyn AppendListener>,
    write_listeners: Arc<ListenerSet<dyn WriteListener>>,
}

impl AppendListenerAdapter {
    pub(super) fn new(
        delegate: Arc<dyn AppendListener>,
        write_listeners: Arc<ListenerSet<dyn WriteListener>>,
    ) -> Self {
        Self {
            delegate,
            write_listeners,
        }
    }
}

impl RaftAppendListener for AppendListenerAdapter {
    fn on_write(&self, indexed: &IndexedEntry) {
        let index = indexed.index();
        let highest_position = indexed.highest_position();
        self.delegate.on_write(index, highest_position);
        self.write_listeners
            .for_each(|listener| listener.on_write(index, highest_position));
    }

    fn on_write_error(&self, error: AppError) {
        self.delegate.on_write_error(error);
    }

    fn on_commit(&self, index: u64, highest_position: i64) {
        self.delegate.on_commit(index, highest_position);
    }

    fn on_commit_error(&self, index: u64, error: AppError) {
        self.delegate.on_commit_error(index, error);
    }
}

/// Registered once per storage with the raft layer; turns every commit index advance
/// into a payload-free signal for the storage's commit listeners.
pub(super) struct CommitBroadcast {
    listeners: Arc<ListenerSet<dyn CommitListener>>,
}

impl CommitBroadcast {
    pub(super) fn new(listeners: Arc<ListenerSet<dyn CommitListener>>) -> Self {
        Self { listeners }
    }
}

impl RaftCommitListener for CommitBroadcast {
    fn on_commit(&self, _index: u64) {
        self.listeners.for_each(|listener| listener.on_commit());
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::raft::{ApplicationEntry, RaftEntry};

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl AppendListener for Calls {
        fn on_write(&self, index: u64, highest_position: i64) {
            self.0.lock().push(format!("write {} {}", index, highest_position));
        }
        fn on_commit(&self, index: u64, highest_position: i64) {
            self.0.lock().push(format!("commit {} {}", index, highest_position));
        }
        fn on_write_error(&self, _error: AppError) {
            self.0.lock().push("write error".to_string());
        }
        fn on_commit_error(&self, index: u64, _error: AppError) {
            self.0.lock().push(format!("commit error {}", index));
        }
    }

    impl WriteListener for Calls {
        fn on_write(&self, index: u64, highest_position: i64) {
            self.0
                .lock()
                .push(format!("broadcast {} {}", index, highest_position));
        }
    }

    #[test]
    fn test_write_reaches_delegate_then_write_listeners() {
        let delegate = Arc::new(Calls::default());
        let observer = Arc::new(Calls::default());
        let write_listeners: Arc<ListenerSet<dyn WriteListener>> = Arc::new(ListenerSet::new());
        write_listeners.add(observer.clone());

        let adapter = AppendListenerAdapter::new(delegate.clone(), write_listeners);
        let entry = IndexedEntry::new(
            7,
            1,
            RaftEntry::Application(ApplicationEntry::new(10, 12, Bytes::new())),
        );
        adapter.on_write(&entry);
        adapter.on_write(&IndexedEntry::new(8, 1, RaftEntry::Initial));
        adapter.on_commit(7, 12);
        adapter.on_commit_error(8, AppError::NotLeader("stepped down".to_string()));

        assert_eq!(
            *delegate.0.lock(),
            vec!["write 7 12", "write 8 -1", "commit 7 12", "commit error 8"]
        );
        assert_eq!(*observer.0.lock(), vec!["broadcast 7 12", "broadcast 8 -1"]);
    }
}
