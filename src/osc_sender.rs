use crate::sink::{OutputEvent, OutputSink};
use crate::types::{StrumDirection, StrumEvent};
use log::{debug, info};
use rosc::{OscMessage, OscPacket, OscType};
use std::io;
use std::net::UdpSocket;

/// Sends glove output as OSC over UDP.
///
/// Addresses:
///   /glove/finger/{0..3}   int 0|1, one message per finger on every change
///   /glove/fingers         int ×4, the whole vector
///   /glove/strum/{hand}    int +1 (down) / −1 (up), float projection
pub struct OscSink {
    socket: UdpSocket,
    target: String,
}

impl OscSink {
    pub fn new(target: impl Into<String>) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let target = target.into();
        info!("OSC sender → {}", target);
        Ok(Self { socket, target })
    }

    fn send_fingers(&self, states: &[bool]) -> Result<(), Box<dyn std::error::Error>> {
        for (i, &on) in states.iter().enumerate() {
            let addr = format!("/glove/finger/{}", i);
            self.send_message(&addr, vec![OscType::Int(on as i32)])?;
        }
        let all = states.iter().map(|&on| OscType::Int(on as i32)).collect();
        self.send_message("/glove/fingers", all)
    }

    fn send_strum(&self, strum: &StrumEvent) -> Result<(), Box<dyn std::error::Error>> {
        let addr = format!("/glove/strum/{}", strum.hand);
        let dir = match strum.direction {
            StrumDirection::Down => 1,
            StrumDirection::Up => -1,
        };
        self.send_message(
            &addr,
            vec![OscType::Int(dir), OscType::Float(strum.projection as f32)],
        )
    }

    fn send_message(
        &self,
        addr: &str,
        args: Vec<OscType>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let msg = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let buf = rosc::encoder::encode(&msg)?;
        self.socket.send_to(&buf, &self.target)?;
        Ok(())
    }
}

impl OutputSink for OscSink {
    fn send(&mut self, event: &OutputEvent) {
        let result = match event {
            OutputEvent::Fingers(states) => self.send_fingers(states),
            OutputEvent::Strum(s) => self.send_strum(s),
        };
        if let Err(e) = result {
            debug!("OSC send error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hand;
    use rosc::decoder::decode_udp;
    use std::time::Duration;

    fn recv_message(socket: &UdpSocket) -> OscMessage {
        let mut buf = [0u8; 1024];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        match decode_udp(&buf[..n]).unwrap().1 {
            OscPacket::Message(m) => m,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_strum_message() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut sink = OscSink::new(listener.local_addr().unwrap().to_string()).unwrap();

        sink.send(&OutputEvent::Strum(StrumEvent {
            hand: Hand::Slave,
            direction: StrumDirection::Up,
            projection: -9000.0,
        }));
        let msg = recv_message(&listener);
        assert_eq!(msg.addr, "/glove/strum/slave");
        assert_eq!(msg.args[0], OscType::Int(-1));
        assert_eq!(msg.args[1], OscType::Float(-9000.0));
    }

    #[test]
    fn test_finger_messages() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut sink = OscSink::new(listener.local_addr().unwrap().to_string()).unwrap();

        sink.send(&OutputEvent::Fingers([false, true, false, false]));
        let addrs: Vec<OscMessage> = (0..5).map(|_| recv_message(&listener)).collect();
        assert_eq!(addrs[1].addr, "/glove/finger/1");
        assert_eq!(addrs[1].args, vec![OscType::Int(1)]);
        assert_eq!(addrs[4].addr, "/glove/fingers");
        assert_eq!(addrs[4].args.len(), 4);
    }
}
