// redis 风格帧编码/解码
//
// 服务端只接收 inline 命令（单行，空白分隔）；
// 推送载荷使用 multi-bulk 帧：*N\r\n 后接 N 个 $len\r\n<payload>\r\n。
// 单行回复以 "+"（成功）或 "-ERR "（失败）开头。

use crate::network::BlockingTcpClient;
use std::time::Duration;

/// 追加 multi-bulk 头：*N\r\n
pub fn fmt_multi_bulk_len(buf: &mut Vec<u8>, n: usize) {
    buf.extend_from_slice(format!("*{}\r\n", n).as_bytes());
}

/// 追加一个 bulk string：$len\r\n<payload>\r\n
pub fn fmt_bulk(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}

/// 解析 inline 命令行（空白分隔）
pub fn parse_inline(line: &str) -> Vec<String> {
    line.split_whitespace().map(|s| s.to_string()).collect()
}

/// 从连接上读取一个完整的 multi-bulk 帧（副本应用侧 / 测试用）
pub fn read_multi_bulk(
    client: &mut BlockingTcpClient,
    timeout: Duration,
) -> Result<Vec<Vec<u8>>, String> {
    let header = client.read_line(timeout)?;
    let n: usize = header
        .strip_prefix('*')
        .ok_or_else(|| format!("Bad multi-bulk header: {}", header))?
        .parse()
        .map_err(|e| format!("Bad multi-bulk count {}: {}", header, e))?;

    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        let len_line = client.read_line(timeout)?;
        let len: usize = len_line
            .strip_prefix('$')
            .ok_or_else(|| format!("Bad bulk header: {}", len_line))?
            .parse()
            .map_err(|e| format!("Bad bulk length {}: {}", len_line, e))?;

        let mut payload = client.read_data(len + 2, timeout)?;
        if &payload[len..] != b"\r\n" {
            return Err("Bulk payload missing terminator".to_string());
        }
        payload.truncate(len);
        args.push(payload);
    }
    Ok(args)
}
