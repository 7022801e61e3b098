//! Storage state machine (spec §4.7), grounded on the original `db.Store`:
//! `Get`/`Put` handlers implementing the two-level redirect model and
//! free-space-driven shard selection. Both handlers retain the inbound
//! buffer and finish their work on a blocking background task so the
//! dispatcher's consumer loop is never held up by disk I/O.

use crate::codec::{MessageReader, MessageWriter};
use crate::dispatch::Dispatcher;
use crate::error::MeshError;
use crate::ring::subscriber::SendStrategy;
use crate::storage::shard::{Freespace, Shard, StoredEntry, UserMeta};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MH_GET: u64 = 0x10001;
pub const MH_GET_RESPONSE: u64 = 0x10002;
pub const MH_PUT: u64 = 0x10003;
pub const MH_PUT_RESPONSE: u64 = 0x10004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
enum RespCode {
    Ok = 0,
    NotFound = 1,
    IoError = 2,
    DeadTargetNode = 3,
    Illegal = 4,
}

pub struct StorageHandler {
    data: Vec<Option<Arc<dyn Shard>>>,
    redirects: Option<Arc<dyn Shard>>,
    freespace: Vec<Option<Arc<dyn Freespace>>>,
    /// Whether `Put`'s success response reuses `MH_GetResponse` (the
    /// original's wire bug, preserved by default for compatibility with
    /// existing peers; spec §9 open question).
    legacy_put_response_bug: bool,
}

impl StorageHandler {
    pub fn new(
        data: Vec<Option<Arc<dyn Shard>>>,
        redirects: Option<Arc<dyn Shard>>,
        freespace: Vec<Option<Arc<dyn Freespace>>>,
        legacy_put_response_bug: bool,
    ) -> Arc<Self> {
        Arc::new(Self { data, redirects, freespace, legacy_put_response_bug })
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>) {
        let get_handler = self.clone();
        dispatcher.register(
            MH_GET,
            Arc::new(move |node, reader| get_handler.clone().on_get(node, reader)),
        );
        let put_handler = self.clone();
        dispatcher.register(
            MH_PUT,
            Arc::new(move |node, reader| put_handler.clone().on_put(node, reader)),
        );
    }

    fn on_get(self: Arc<Self>, node: Arc<Dispatcher>, reader: &mut MessageReader) -> bool {
        let hashnum = match reader.decode_int() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let key = match reader.decode_bytes() {
            Ok(v) => v,
            Err(_) => return false,
        };
        reader.retain();
        let forked = reader.fork();
        tokio::task::spawn_blocking(move || self.do_get(&node, hashnum, key, forked));
        false
    }

    fn do_get(&self, node: &Dispatcher, hashnum: i64, key: Bytes, mut reader: MessageReader) {
        let n = self.data.len();
        let mut usehash = hashnum;
        let max_iterations = n + 1;
        let mut iteration = 0usize;

        let result: Result<StoredEntry, MeshError> = loop {
            if iteration >= max_iterations {
                break Err(MeshError::Loop);
            }
            iteration += 1;

            let mut item: Option<StoredEntry> = None;
            let mut ierr = MeshError::NotFound;

            if n > 0 {
                let idx = usehash.rem_euclid(n as i64) as usize;
                if let Some(shard) = self.data.get(idx).and_then(|s| s.as_ref()) {
                    match shard.get(&key) {
                        Ok(Some(e)) => item = Some(e),
                        Ok(None) => {}
                        Err(e) => ierr = e,
                    }
                }
            }
            if item.is_none() {
                if let Some(redirects) = &self.redirects {
                    match redirects.get(&key) {
                        Ok(Some(e)) => item = Some(e),
                        Ok(None) => {}
                        Err(e) => ierr = e,
                    }
                }
            }

            let Some(entry) = item else {
                break Err(ierr);
            };

            if entry.user_meta == UserMeta::InnerRedirect {
                let new_usehash: i64 = match rmp_serde::from_slice(&entry.value) {
                    Ok(v) => v,
                    Err(e) => break Err(MeshError::from(e)),
                };
                if new_usehash == usehash {
                    break Err(MeshError::Loop);
                }
                usehash = new_usehash;
                continue;
            }

            break Ok(entry);
        };

        // Outer redirect: forward a fresh MH_Get, verbatim tail included, and
        // let the destination node answer reply_to directly — no local reply.
        if let Ok(entry) = &result {
            if entry.user_meta == UserMeta::OuterRedirect {
                let target = match std::str::from_utf8(&entry.value) {
                    Ok(s) => s.to_string(),
                    Err(_) => return,
                };
                if node.lookup(&target).is_some() {
                    let mut out = MessageWriter::new();
                    out.write_u64(MH_GET);
                    out.write_int(hashnum);
                    out.write_bytes(&key);
                    out.extend_raw(reader.remaining());
                    node.send(SendStrategy::BestFit, &target, out.into_bytes());
                    return;
                }
                // Dead target: fall through to the common reply path below,
                // answering the original caller instead of the redirect's.
                self.respond_get(node, &mut reader, RespCode::DeadTargetNode, None, None);
                return;
            }
        }

        let code = match &result {
            Ok(_) => RespCode::Ok,
            Err(MeshError::NotFound) => RespCode::NotFound,
            Err(_) => RespCode::IoError,
        };
        let value = result.as_ref().ok().map(|e| e.value.clone());
        let message = result.as_ref().err().map(|e| e.io_message());
        self.respond_get(node, &mut reader, code, value, message);
    }

    /// Decodes `reply_to`/`reply_id` off the tail and sends the response,
    /// matching the original's decode-late-then-reply ordering so the tail
    /// stays untouched for the forwarding path above.
    fn respond_get(
        &self,
        node: &Dispatcher,
        reader: &mut MessageReader,
        code: RespCode,
        value: Option<Bytes>,
        message: Option<String>,
    ) {
        let reply_to = match reader.decode_string() {
            Ok(v) => v,
            Err(_) => return,
        };
        if node.lookup(&reply_to).is_none() {
            debug!(reply_to, "get response target unknown, dropping");
            return;
        }
        let reply_id = match reader.decode_u64() {
            Ok(v) => v,
            Err(_) => return,
        };

        let mut out = MessageWriter::new();
        out.write_u64(MH_GET_RESPONSE);
        out.write_u64(reply_id);
        out.write_int(code as i64);
        match code {
            RespCode::Ok => {
                out.write_bytes(value.as_deref().unwrap_or(&[]));
            }
            RespCode::IoError => {
                out.write_string(message.as_deref().unwrap_or("io error"));
            }
            _ => {}
        }
        node.send(SendStrategy::BestFit, &reply_to, out.into_bytes());
    }

    fn on_put(self: Arc<Self>, node: Arc<Dispatcher>, reader: &mut MessageReader) -> bool {
        let hashnum = match reader.decode_int() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let meta_byte = match reader.decode_u8() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let expires_at = match reader.decode_u64() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let key = match reader.decode_bytes() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let value = match reader.decode_bytes() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let reply_to = match reader.decode_string() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let reply_id = match reader.decode_u64() {
            Ok(v) => v,
            Err(_) => return false,
        };
        reader.retain();

        tokio::task::spawn_blocking(move || {
            self.do_put(&node, hashnum, meta_byte, expires_at, key, value, reply_to, reply_id)
        });
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn do_put(
        &self,
        node: &Dispatcher,
        hashnum: i64,
        meta_byte: u8,
        expires_at: u64,
        key: Bytes,
        value: Bytes,
        reply_to: String,
        reply_id: u64,
    ) {
        let meta = match meta_byte {
            0 => UserMeta::Raw,
            2 => UserMeta::OuterRedirect,
            _ => {
                self.send_put_response(node, &reply_to, reply_id, RespCode::Illegal, None);
                return;
            }
        };

        let n = self.data.len();
        let f = self.freespace.len();
        let rawdata = meta == UserMeta::Raw;
        let pos_1 = if n > 0 { hashnum.rem_euclid(n as i64) as usize } else { 0 };
        let mut pos_2 = pos_1;

        let has_space = |i: usize| -> bool {
            if self.data.get(i).and_then(|s| s.as_ref()).is_none() {
                return false;
            }
            match self.freespace.get(i).and_then(|fs| fs.as_ref()) {
                Some(fs) => fs.has_free_space(key.len(), value.len()),
                None => true,
            }
        };

        let mut hfs = n > 0 && has_space(pos_2);
        if !hfs {
            for i in 0..n {
                if has_space(i) {
                    pos_2 = i;
                    hfs = true;
                    break;
                }
            }
        }
        if !hfs {
            self.send_put_response(node, &reply_to, reply_id, RespCode::IoError, Some("No Disk Space".to_string()));
            return;
        }

        let mut used_redirects = self.data[pos_2].is_none();
        let mut store = self.data[pos_2].clone().or_else(|| self.redirects.clone());
        if pos_2 < f && !used_redirects && !rawdata {
            if let Some(fs) = &self.freespace[pos_2] {
                if !fs.has_free_space(key.len(), value.len()) {
                    store = self.redirects.clone();
                    used_redirects = true;
                }
            }
        }

        let Some(store) = store else {
            self.send_put_response(node, &reply_to, reply_id, RespCode::IoError, Some("No Disk Space".to_string()));
            return;
        };

        let primary_result = store.put(StoredEntry { key: key.clone(), value, user_meta: meta, expires_at });

        let mut redirect_result: Result<(), MeshError> = Ok(());
        if pos_1 != pos_2 && !used_redirects {
            match rmp_serde::to_vec(&(pos_2 as i64)) {
                Ok(encoded) => {
                    let hint_store = self.data[pos_1].clone().or_else(|| self.redirects.clone());
                    if let Some(hint_store) = hint_store {
                        redirect_result = hint_store.put(StoredEntry {
                            key,
                            value: Bytes::from(encoded),
                            user_meta: UserMeta::InnerRedirect,
                            expires_at,
                        });
                    }
                }
                Err(e) => redirect_result = Err(MeshError::from(e)),
            }
        }

        // Whichever put completes last "wins" in the original's WaitGroup
        // race; our sequential execution treats the redirect hint (run
        // second) as that last writer when both fail.
        match redirect_result.err().or(primary_result.err()) {
            None => self.send_put_response(node, &reply_to, reply_id, RespCode::Ok, None),
            Some(e) => {
                warn!(error = %e, "put failed");
                self.send_put_response(node, &reply_to, reply_id, RespCode::IoError, Some(e.io_message()));
            }
        }

        if pos_1 < f {
            if let Some(fs) = &self.freespace[pos_1] {
                fs.touch();
            }
        }
        if pos_1 != pos_2 && pos_2 < f {
            if let Some(fs) = &self.freespace[pos_2] {
                fs.touch();
            }
        }
    }

    fn send_put_response(&self, node: &Dispatcher, reply_to: &str, reply_id: u64, code: RespCode, message: Option<String>) {
        if node.lookup(reply_to).is_none() {
            return;
        }
        let header = if self.legacy_put_response_bug { MH_GET_RESPONSE } else { MH_PUT_RESPONSE };
        let mut out = MessageWriter::new();
        out.write_u64(header);
        out.write_u64(reply_id);
        out.write_int(code as i64);
        if let Some(message) = message {
            out.write_string(&message);
        }
        node.send(SendStrategy::BestFit, reply_to, out.into_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::{MemFreespace, MemShard};
    use crate::substrate::{LoopbackSubstrate, MemberInfo};
    use tokio::sync::mpsc;

    /// Wires one dispatcher into a shared [`LoopbackSubstrate`]: registers an
    /// inbox for `name` and bridges it into the delegate's bounded queue, the
    /// way a real substrate's `on_message` callback would.
    fn spawn_node(substrate: &Arc<LoopbackSubstrate>, name: &str) -> Arc<Dispatcher> {
        let node = Dispatcher::new(name, substrate.clone());
        let (tx, mut rx) = mpsc::channel(64);
        substrate.register(name, tx);
        let deleg = node.deleg.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                deleg.notify_msg(bytes);
            }
        });
        node.start();
        node
    }

    fn join_each_other(a: &Arc<Dispatcher>, b: &Arc<Dispatcher>) {
        let info_a =
            MemberInfo { name: a.local_name_str().to_string(), metadata: Vec::new(), address: "127.0.0.1:1".parse().unwrap() };
        let info_b =
            MemberInfo { name: b.local_name_str().to_string(), metadata: Vec::new(), address: "127.0.0.1:2".parse().unwrap() };
        a.deleg.notify_join(info_a.clone());
        a.deleg.notify_join(info_b.clone());
        b.deleg.notify_join(info_a);
        b.deleg.notify_join(info_b);
    }

    async fn recv_get_response(rx: &mut mpsc::Receiver<Bytes>) -> (u64, i64, MessageReader) {
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for response")
            .expect("channel closed");
        let mut r = MessageReader::new(bytes);
        assert_eq!(r.decode_u64().unwrap(), MH_GET_RESPONSE);
        let reply_id = r.decode_u64().unwrap();
        let code = r.decode_int().unwrap();
        (reply_id, code, r)
    }

    fn send_get(node: &Dispatcher, hashnum: i64, key: &[u8], reply_to: &str, reply_id: u64) {
        let mut w = MessageWriter::new();
        w.write_u64(MH_GET);
        w.write_int(hashnum);
        w.write_bytes(key);
        w.write_string(reply_to);
        w.write_u64(reply_id);
        node.deleg.notify_msg(w.into_bytes());
    }

    fn send_put(node: &Dispatcher, hashnum: i64, meta: u8, expires_at: u64, key: &[u8], value: &[u8], reply_to: &str, reply_id: u64) {
        let mut w = MessageWriter::new();
        w.write_u64(MH_PUT);
        w.write_int(hashnum);
        w.write_u8(meta);
        w.write_u64(expires_at);
        w.write_bytes(key);
        w.write_bytes(value);
        w.write_string(reply_to);
        w.write_u64(reply_id);
        node.deleg.notify_msg(w.into_bytes());
    }

    #[tokio::test]
    async fn s1_local_put_then_get_roundtrips() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let node = spawn_node(&substrate, "self");
        join_each_other(&node, &node);
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("self-reply", tx);
        node.deleg.notify_join(MemberInfo {
            name: "self-reply".to_string(),
            metadata: Vec::new(),
            address: "127.0.0.1:3".parse().unwrap(),
        });

        let store = StorageHandler::new(
            vec![Some(MemShard::new()), Some(MemShard::new())],
            None,
            vec![Some(MemFreespace::always(true)), Some(MemFreespace::always(true))],
            true,
        );
        store.attach(&node);

        send_put(&node, 5, 0, 0, b"a", b"1", "self-reply", 7);
        let (reply_id, code, _) = recv_get_response(&mut rx).await;
        assert_eq!(reply_id, 7);
        assert_eq!(code, RespCode::Ok as i64);

        send_get(&node, 5, b"a", "self-reply", 8);
        let (reply_id, code, mut r) = recv_get_response(&mut rx).await;
        assert_eq!(reply_id, 8);
        assert_eq!(code, RespCode::Ok as i64);
        assert_eq!(&r.decode_bytes().unwrap()[..], b"1");
    }

    #[tokio::test]
    async fn s2_inner_redirect_then_get_follows_hint() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let node = spawn_node(&substrate, "self");
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("self-reply", tx);
        node.deleg.notify_join(MemberInfo {
            name: "self-reply".to_string(),
            metadata: Vec::new(),
            address: "127.0.0.1:3".parse().unwrap(),
        });

        let fs0 = MemFreespace::always(true);
        let fs1 = MemFreespace::always(false);
        let store = StorageHandler::new(
            vec![Some(MemShard::new()), Some(MemShard::new())],
            None,
            vec![Some(fs0), Some(fs1)],
            true,
        );
        store.attach(&node);

        // hashnum=1 maps to pos_1=1 which has no space; pos_2=0 chosen instead.
        send_put(&node, 1, 0, 0, b"k", b"v", "self-reply", 1);
        let (_, code, _) = recv_get_response(&mut rx).await;
        assert_eq!(code, RespCode::Ok as i64);

        send_get(&node, 1, b"k", "self-reply", 2);
        let (_, code, mut r) = recv_get_response(&mut rx).await;
        assert_eq!(code, RespCode::Ok as i64);
        assert_eq!(&r.decode_bytes().unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn s3_self_referential_inner_redirect_is_a_loop() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let node = spawn_node(&substrate, "self");
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("self-reply", tx);
        node.deleg.notify_join(MemberInfo {
            name: "self-reply".to_string(),
            metadata: Vec::new(),
            address: "127.0.0.1:3".parse().unwrap(),
        });

        let shard0 = MemShard::new();
        shard0
            .put(StoredEntry {
                key: Bytes::from_static(b"loop"),
                value: Bytes::from(rmp_serde::to_vec(&0i64).unwrap()),
                user_meta: UserMeta::InnerRedirect,
                expires_at: 0,
            })
            .unwrap();
        let store = StorageHandler::new(vec![Some(shard0)], None, vec![None], true);
        store.attach(&node);

        send_get(&node, 0, b"loop", "self-reply", 9);
        let (reply_id, code, _) = recv_get_response(&mut rx).await;
        assert_eq!(reply_id, 9);
        assert_eq!(code, RespCode::IoError as i64);
    }

    #[tokio::test]
    async fn s4_outer_redirect_forwards_and_target_answers_directly() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let a = spawn_node(&substrate, "a");
        let b = spawn_node(&substrate, "b");
        join_each_other(&a, &b);
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("client", tx);
        a.deleg.notify_join(MemberInfo { name: "client".to_string(), metadata: Vec::new(), address: "127.0.0.1:4".parse().unwrap() });
        b.deleg.notify_join(MemberInfo { name: "client".to_string(), metadata: Vec::new(), address: "127.0.0.1:4".parse().unwrap() });

        let shard_a = MemShard::new();
        shard_a
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"b"),
                user_meta: UserMeta::OuterRedirect,
                expires_at: 0,
            })
            .unwrap();
        let store_a = StorageHandler::new(vec![Some(shard_a)], None, vec![None], true);
        store_a.attach(&a);

        let shard_b = MemShard::new();
        shard_b
            .put(StoredEntry { key: Bytes::from_static(b"k"), value: Bytes::from_static(b"v"), user_meta: UserMeta::Raw, expires_at: 0 })
            .unwrap();
        let store_b = StorageHandler::new(vec![Some(shard_b)], None, vec![None], true);
        store_b.attach(&b);

        send_get(&a, 0, b"k", "client", 11);
        let (reply_id, code, mut r) = recv_get_response(&mut rx).await;
        assert_eq!(reply_id, 11);
        assert_eq!(code, RespCode::Ok as i64);
        assert_eq!(&r.decode_bytes().unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn s5_outer_redirect_to_dead_node_reports_dead_target() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let a = spawn_node(&substrate, "a");
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("client", tx);
        a.deleg.notify_join(MemberInfo { name: "client".to_string(), metadata: Vec::new(), address: "127.0.0.1:4".parse().unwrap() });

        let shard_a = MemShard::new();
        shard_a
            .put(StoredEntry {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"b"),
                user_meta: UserMeta::OuterRedirect,
                expires_at: 0,
            })
            .unwrap();
        let store_a = StorageHandler::new(vec![Some(shard_a)], None, vec![None], true);
        store_a.attach(&a);

        send_get(&a, 0, b"k", "client", 12);
        let (reply_id, code, _) = recv_get_response(&mut rx).await;
        assert_eq!(reply_id, 12);
        assert_eq!(code, RespCode::DeadTargetNode as i64);
    }

    #[tokio::test]
    async fn illegal_put_meta_is_rejected() {
        let substrate = Arc::new(LoopbackSubstrate::new());
        let node = spawn_node(&substrate, "self");
        let (tx, mut rx) = mpsc::channel(8);
        substrate.register("self-reply", tx);
        node.deleg.notify_join(MemberInfo {
            name: "self-reply".to_string(),
            metadata: Vec::new(),
            address: "127.0.0.1:3".parse().unwrap(),
        });
        let store = StorageHandler::new(vec![Some(MemShard::new())], None, vec![None], true);
        store.attach(&node);

        // meta=1 (InnerRedirect) is not a client-settable user meta.
        send_put(&node, 0, 1, 0, b"k", b"v", "self-reply", 1);
        let (_, code, _) = recv_get_response(&mut rx).await;
        assert_eq!(code, RespCode::Illegal as i64);
    }
}
