//! HTTP 抓取能力
//!
//! 引擎只需要两个操作：HEAD 探测和（可选 Range 的）流式 GET。
//! 流被丢弃时底层连接随之中断，暂停/取消就是靠这一点及时生效的。

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::error::DownloadError;

/// 响应体字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Content-Length（未知时为 None）
    pub total: Option<u64>,
    /// 是否支持 Range 请求
    pub accepts_ranges: bool,
}

/// HTTP 抓取接口
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// 发送 HEAD 请求，获取资源长度和 Range 支持情况
    async fn probe(&self, url: &str) -> Result<ProbeInfo, DownloadError>;

    /// 发送 GET 请求并返回响应体流
    ///
    /// `range` 为左闭右开区间，为 None 时不带 Range 头
    async fn open(&self, url: &str, range: Option<Range<u64>>) -> Result<ByteStream, DownloadError>;
}

/// 基于 reqwest 的实现
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    /// 创建下载专用的 HTTP 客户端
    ///
    /// 不设置整体超时：大分片的传输时间不可预估，只限制建连时间
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(concat!("media-downloader/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn probe(&self, url: &str) -> Result<ProbeInfo, DownloadError> {
        let resp = self.client.head(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }

        // HEAD 响应没有响应体，reqwest 的 content_length() 在这里不可靠，直接解析头部
        let total = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        let accepts_ranges = status == StatusCode::PARTIAL_CONTENT
            || resp
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

        debug!(
            "探测完成: url={}, status={}, 长度={:?}, 支持Range={}",
            url, status, total, accepts_ranges
        );

        Ok(ProbeInfo {
            total,
            accepts_ranges,
        })
    }

    async fn open(&self, url: &str, range: Option<Range<u64>>) -> Result<ByteStream, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(range) = &range {
            request = request.header(RANGE, format!("bytes={}-{}", range.start, range.end - 1));
        }

        let resp = request.send().await?;
        let status = resp.status();

        // 带 Range 的请求必须返回 206，否则响应体不是我们要的那一段
        let acceptable = match range {
            Some(_) => status == StatusCode::PARTIAL_CONTENT,
            None => status.is_success(),
        };
        if !acceptable {
            return Err(DownloadError::HttpStatus(status.as_u16()));
        }

        Ok(resp
            .bytes_stream()
            .map(|item| item.map_err(DownloadError::from))
            .boxed())
    }
}
