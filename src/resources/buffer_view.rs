//! Buffer view wrapper, for texel buffers (`samplerBuffer`/`imageBuffer`).

use ash::vk;

use crate::cookie::Cookie;
use crate::format::Format;
use crate::handle::{HasCookie, Handle};

use super::Buffer;

pub struct BufferView {
    cookie: Cookie,
    buffer: Handle<Buffer>,
    raw: vk::BufferView,
    format: Format,
    offset: u64,
    range: u64,
}

impl BufferView {
    pub(crate) fn new(
        cookie: Cookie,
        buffer: Handle<Buffer>,
        raw: vk::BufferView,
        format: Format,
        offset: u64,
        range: u64,
    ) -> Self {
        BufferView {
            cookie,
            buffer,
            raw,
            format,
            offset,
            range,
        }
    }

    pub fn buffer(&self) -> &Handle<Buffer> {
        &self.buffer
    }

    pub fn raw(&self) -> vk::BufferView {
        self.raw
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn range(&self) -> u64 {
        self.range
    }
}

impl HasCookie for BufferView {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}
