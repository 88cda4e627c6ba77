use parking_lot::Mutex;

use stream::Result;

use crate::{MessageType, payload_stream_id};

struct Entry {
    id: i32,
    tag: u8,
    payload: Vec<u8>,
}

/// Retains the latest format-declaration message per `(stream id, type)`
/// so a late consumer can be brought up to date.
///
/// Entries are replayed in insertion order; resubmitting a pair
/// overwrites the payload in place.
pub struct StateTracker {
    entries: Mutex<Vec<Entry>>,
}

impl StateTracker {
    pub fn new() -> StateTracker {
        StateTracker { entries: Mutex::new(Vec::new()) }
    }

    /// Record `payload` if the message is a sticky kind; anything else
    /// passes through untouched.
    pub fn submit(&self, tag: u8, payload: &[u8]) {
        let sticky = MessageType::try_from(tag).is_ok_and(|t| t.is_sticky());
        if !sticky {
            return;
        }
        let Some(id) = payload_stream_id(payload) else {
            log::warn!("tracker: sticky message 0x{tag:02x} too short, ignored");
            return;
        };
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.id == id && e.tag == tag) {
            Some(i) => entries[i].payload = payload.to_vec(),
            None => entries.push(Entry { id, tag, payload: payload.to_vec() }),
        }
    }

    /// Replay every retained message through `f` in insertion order.
    pub fn visit(&self, f: &mut dyn FnMut(u8, &[u8]) -> Result<()>) -> Result<()> {
        let entries = self.entries.lock();
        for e in entries.iter() {
            f(e.tag, &e.payload)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        StateTracker::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{AudioFormat, Codable, SampleFormat, VideoFormat, PixelFormat};

    #[test]
    fn newest_value_wins_per_id_and_type() {
        let t = StateTracker::new();
        let a = AudioFormat {
            id: 1,
            flags: 0,
            rate: 44_100,
            channels: 2,
            format: SampleFormat::S16Le,
        };
        t.submit(MessageType::AudioFormat.tag(), &a.encode_vec());
        let b = AudioFormat { rate: 48_000, ..a };
        t.submit(MessageType::AudioFormat.tag(), &b.encode_vec());
        assert_eq!(t.len(), 1);

        let mut seen = Vec::new();
        t.visit(&mut |tag, payload| {
            seen.push((tag, AudioFormat::decode_slice(payload).unwrap()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(MessageType::AudioFormat.tag(), b)]);
    }

    #[test]
    fn replay_keeps_insertion_order_and_skips_data() {
        let t = StateTracker::new();
        let vf = VideoFormat {
            id: 1,
            flags: 0,
            width: 16,
            height: 16,
            format: PixelFormat::Bgr24,
        };
        let af = AudioFormat {
            id: 1,
            flags: 0,
            rate: 44_100,
            channels: 2,
            format: SampleFormat::S16Le,
        };
        t.submit(MessageType::VideoFormat.tag(), &vf.encode_vec());
        t.submit(MessageType::AudioData.tag(), &[0u8; 32]);
        t.submit(MessageType::AudioFormat.tag(), &af.encode_vec());

        let mut tags = Vec::new();
        t.visit(&mut |tag, _| {
            tags.push(tag);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            tags,
            vec![MessageType::VideoFormat.tag(), MessageType::AudioFormat.tag()]
        );
    }
}
