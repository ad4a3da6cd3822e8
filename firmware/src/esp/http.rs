use std::time::Duration;

use anyhow::{bail, Result};
use embedded_svc::http::Method as HttpMethod;
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

use crate::client::{Http, Method, Response};

const MAX_RESPONSE: usize = 16 * 1024;

pub struct EspHttp {
    conn: EspHttpConnection,
}

impl EspHttp {
    pub fn new() -> Result<Self> {
        let conn = EspHttpConnection::new(&Configuration {
            timeout: Some(Duration::from_secs(15)),
            buffer_size: Some(2048),
            ..Default::default()
        })?;
        Ok(Self { conn })
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.conn.write(data)?;
            if n == 0 {
                bail!("connection closed while sending");
            }
            data = &data[n..];
        }
        Ok(())
    }
}

impl Http for EspHttp {
    fn request(&mut self, method: Method, url: &str, body: Option<&[u8]>) -> Result<Response> {
        let method = match method {
            Method::Get => HttpMethod::Get,
            Method::Post => HttpMethod::Post,
        };
        let len = body.map_or(0, <[u8]>::len).to_string();
        let mut headers = vec![("Accept", "application/json")];
        if body.is_some() {
            headers.push(("Content-Type", "application/json"));
            headers.push(("Content-Length", len.as_str()));
        }

        self.conn.initiate_request(method, url, &headers)?;
        if let Some(body) = body {
            self.write_all(body)?;
        }
        self.conn.initiate_response()?;
        let status = self.conn.status();

        let mut body = Vec::new();
        let mut buf = [0_u8; 512];
        loop {
            let n = self.conn.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if body.len() + n > MAX_RESPONSE {
                bail!("response larger than {MAX_RESPONSE} bytes");
            }
            body.extend_from_slice(&buf[..n]);
        }

        Ok(Response { status, body })
    }

    fn open(&mut self, url: &str) -> Result<(u16, Option<u64>)> {
        self.conn.initiate_request(HttpMethod::Get, url, &[])?;
        self.conn.initiate_response()?;
        let len = self
            .conn
            .header("Content-Length")
            .and_then(|v| v.parse().ok());
        Ok((self.conn.status(), len))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.conn.read(buf)?)
    }

    fn close(&mut self) {
        // the next initiate_request resets the connection
    }
}
