// 阻塞式 framed TCP 客户端
//
// 复制路径上的全部 socket I/O 都带显式超时（秒级粒度）：
// - write_line / write_data 映射到 SO_SNDTIMEO
// - read_line / read_data   映射到 SO_RCVTIMEO
// 超时视为错误，由上层决定淘汰或中止。

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const LINE_MAX: usize = 64 * 1024;

/// 阻塞式 framed TCP 客户端
///
/// 行帧以 \r\n 结尾；读取端内部维护缓冲，行与定长数据可交替读取。
pub struct BlockingTcpClient {
    stream: TcpStream,
    /// 已从 socket 读入但尚未消费的字节
    buf: Vec<u8>,
}

impl BlockingTcpClient {
    pub fn from_stream(stream: TcpStream) -> Result<Self, String> {
        stream
            .set_nodelay(true)
            .map_err(|e| format!("Set nodelay failed: {}", e))?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, String> {
        let sock_addr = addr
            .parse()
            .map_err(|e| format!("Invalid address {}: {}", addr, e))?;
        let stream = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(|e| format!("Connect {} failed: {}", addr, e))?;
        Self::from_stream(stream)
    }

    /// 对端地址（日志用）
    pub fn remote_repr(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }

    /// 写一行（自动追加 \r\n）
    pub fn write_line(&mut self, line: &str, timeout: Duration) -> Result<(), String> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_data(&data, timeout)
    }

    /// 写定长数据
    pub fn write_data(&mut self, data: &[u8], timeout: Duration) -> Result<(), String> {
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| format!("Set write timeout failed: {}", e))?;
        self.stream
            .write_all(data)
            .map_err(|e| format!("Write to {} failed: {}", self.remote_repr(), e))?;
        self.stream
            .flush()
            .map_err(|e| format!("Flush to {} failed: {}", self.remote_repr(), e))
    }

    /// 读一行（剥掉 \r\n）
    pub fn read_line(&mut self, timeout: Duration) -> Result<String, String> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| format!("Set read timeout failed: {}", e))?;

        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).take(pos).collect();
                return String::from_utf8(line)
                    .map_err(|e| format!("Non-utf8 line from {}: {}", self.remote_repr(), e));
            }
            if self.buf.len() > LINE_MAX {
                return Err(format!("Line too long from {}", self.remote_repr()));
            }
            self.fill_buf()?;
        }
    }

    /// 读定长数据
    pub fn read_data(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, String> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| format!("Set read timeout failed: {}", e))?;

        while self.buf.len() < n {
            self.fill_buf()?;
        }
        Ok(self.buf.drain(..n).collect())
    }

    fn fill_buf(&mut self) -> Result<(), String> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self
            .stream
            .read(&mut chunk)
            .map_err(|e| format!("Read from {} failed: {}", self.remote_repr(), e))?;
        if n == 0 {
            return Err(format!("Connection closed by {}", self.remote_repr()));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}
