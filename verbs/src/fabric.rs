//! In-process fabric: resolves `(lid, qp_num)` to a live queue pair.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::qp::QpInner;

static FABRIC: LazyLock<Mutex<HashMap<(u16, u32), Weak<QpInner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn attach(lid: u16, qp_num: u32, qp: Weak<QpInner>) {
    FABRIC.lock().insert((lid, qp_num), qp);
}

pub(crate) fn detach(lid: u16, qp_num: u32) {
    FABRIC.lock().remove(&(lid, qp_num));
}

pub(crate) fn lookup(lid: u16, qp_num: u32) -> Option<Arc<QpInner>> {
    FABRIC.lock().get(&(lid, qp_num)).and_then(Weak::upgrade)
}
