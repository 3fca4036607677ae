//! 集成测试共享的协作者与等待工具。
//!
//! - [`LineCodec`]：以 `\n` 分帧的最小编解码器；
//! - [`Recorder`]：收集端点事件，供断言事件序列；
//! - [`wait_until`]：在截止时间内轮询条件，避免测试依赖固定的睡眠时长。

#![allow(dead_code)]

use std::{
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use spark_tcp_endpoint::{Deserializer, EndpointEvent, EventPublisher, Serializer};

#[derive(Debug, Default)]
pub struct LineCodec;

impl Serializer for LineCodec {
    fn serialize(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(payload);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Deserializer for LineCodec {
    fn deserialize(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match src.iter().position(|byte| *byte == b'\n') {
            Some(index) => {
                let line = src.split_to(index + 1).freeze();
                Ok(Some(line.slice(..index)))
            }
            None => Ok(None),
        }
    }
}

pub fn line_codec() -> Arc<LineCodec> {
    Arc::new(LineCodec)
}

#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<EndpointEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<EndpointEvent> {
        self.events.lock().expect("事件锁不应中毒").clone()
    }

    pub fn count(&self, predicate: impl Fn(&EndpointEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl EventPublisher for Recorder {
    fn publish(&self, event: EndpointEvent) {
        self.events.lock().expect("事件锁不应中毒").push(event);
    }
}

/// 在 `timeout` 内每 10ms 检查一次条件，超时返回 `false`。
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// 异步版本，避免阻塞运行时工作线程。
pub async fn wait_until_async(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
