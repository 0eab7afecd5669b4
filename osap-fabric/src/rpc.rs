//! Remote-procedure vertices: an endpoint with a typed argument and return
//! schema, reusing the in-place reply machinery.
//!
//! The typed surface lives at construction: a `FnMut(A) -> R` over
//! [`RpcValue`] scalars is wrapped into a byte-level call closure, and the
//! vertex advertises the two type keys and sizes through its INFO reply so
//! callers can marshal without reflection.

use crate::{keys, report::ReportSink, tick::Verdict};

use osap_wire::{Key, ser, write_reply};

/// A scalar that can cross the wire as an RPC argument or return.
pub trait RpcValue: Sized {
    /// Type key advertised in INFO replies.
    const TYPE_KEY: u8;
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Encode into exactly [`Self::SIZE`] bytes.
    fn encode(self, out: &mut [u8]);

    /// Decode from exactly [`Self::SIZE`] bytes.
    fn decode(bytes: &[u8]) -> Option<Self>;
}

macro_rules! numeric_rpc_value {
    ($($ty:ty => $key:expr),* $(,)?) => {
        $(
            impl RpcValue for $ty {
                const TYPE_KEY: u8 = $key;
                const SIZE: usize = size_of::<$ty>();

                fn encode(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Option<Self> {
                    Some(<$ty>::from_le_bytes(bytes.get(..Self::SIZE)?.try_into().ok()?))
                }
            }
        )*
    };
}

numeric_rpc_value! {
    u8 => keys::TK_UINT8,
    i8 => keys::TK_INT8,
    u16 => keys::TK_UINT16,
    i16 => keys::TK_INT16,
    u32 => keys::TK_UINT32,
    i32 => keys::TK_INT32,
    u64 => keys::TK_UINT64,
    i64 => keys::TK_INT64,
    f32 => keys::TK_FLOAT32,
    f64 => keys::TK_FLOAT64,
}

impl RpcValue for bool {
    const TYPE_KEY: u8 = keys::TK_BOOL;
    const SIZE: usize = 1;

    fn encode(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(*bytes.first()? != 0)
    }
}

/// Byte-level state behind an RPC vertex.
pub(crate) struct RpcState {
    pub(crate) arg_key: u8,
    pub(crate) arg_size: u16,
    pub(crate) ret_key: u8,
    pub(crate) ret_size: u16,
    /// Decode the argument, run the user function, encode the return into
    /// the output; `None` when the argument bytes don't decode.
    call: Box<dyn FnMut(&[u8], &mut [u8]) -> Option<u16>>,
}

impl RpcState {
    pub(crate) fn wrap<A, R, F>(mut func: F) -> Self
    where
        A: RpcValue,
        R: RpcValue,
        F: FnMut(A) -> R + 'static,
    {
        Self {
            arg_key: A::TYPE_KEY,
            arg_size: A::SIZE as u16,
            ret_key: R::TYPE_KEY,
            ret_size: R::SIZE as u16,
            call: Box::new(move |arg_bytes, out| {
                let arg = A::decode(arg_bytes)?;
                func(arg).encode(&mut out[..R::SIZE]);
                Some(R::SIZE as u16)
            }),
        }
    }
}

/// Handle a DEST-keyed datagram aimed at an RPC vertex.
pub(crate) fn dest(
    state: &mut RpcState,
    report: &mut ReportSink,
    name: &str,
    request: &[u8],
    ptr: usize,
    out: &mut [u8],
) -> Verdict {
    let mut payload = [0u8; crate::MAX_PACKET_SIZE];
    let (Some(&sub), Some(&id)) = (request.get(ptr + 2), request.get(ptr + 3)) else {
        report.error(format!("truncated rpc datagram at {name}"));
        return Verdict::Release;
    };
    match sub {
        keys::RPC_INFO_REQ => {
            payload[0] = Key::Dest.byte();
            payload[1] = keys::RPC_INFO_RES;
            payload[2] = id;
            let mut wptr = 3;
            payload[wptr] = state.arg_key;
            wptr += 1;
            let _ = ser::write_u16(&mut payload, &mut wptr, state.arg_size);
            payload[wptr] = state.ret_key;
            wptr += 1;
            let _ = ser::write_u16(&mut payload, &mut wptr, state.ret_size);
            reply(report, name, request, &payload[..wptr], out)
        }
        keys::RPC_CALL_REQ => {
            let Some(arg_bytes) = request.get(ptr + 4..ptr + 4 + usize::from(state.arg_size))
            else {
                report.error(format!("rpc call at {name} missing argument bytes"));
                return Verdict::Release;
            };
            payload[0] = Key::Dest.byte();
            payload[1] = keys::RPC_CALL_RES;
            payload[2] = id;
            let Some(written) = (state.call)(arg_bytes, &mut payload[3..]) else {
                report.error(format!("rpc call at {name} could not decode its argument"));
                return Verdict::Release;
            };
            reply(report, name, request, &payload[..3 + usize::from(written)], out)
        }
        _ => {
            report.error(format!("unrecognized rpc key {sub} at {name}"));
            Verdict::Release
        }
    }
}

fn reply(
    report: &mut ReportSink,
    name: &str,
    request: &[u8],
    payload: &[u8],
    out: &mut [u8],
) -> Verdict {
    match write_reply(request, out, payload) {
        Ok(len) => Verdict::Reload(len),
        Err(err) => {
            report.error(format!("reply write failed at {name}: {err}"));
            Verdict::Release
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_reply_carries_both_schemas() {
        let mut report = ReportSink::default();
        let mut state = RpcState::wrap(|arg: i16| -> f32 { f32::from(arg) });
        let request = [232, 3, 128, 0, 0xF0, 0xE0, keys::RPC_INFO_REQ, 5];
        let mut out = [0u8; 128];
        let Verdict::Reload(len) = dest(&mut state, &mut report, "rpc_t", &request, 4, &mut out)
        else {
            panic!("expected an info response");
        };
        assert_eq!(
            &out[..len],
            &[
                232, 3, 128, 0, 0xF0, 0xE0, keys::RPC_INFO_RES, 5,
                keys::TK_INT16, 2, 0, keys::TK_FLOAT32, 4, 0
            ]
        );
    }

    #[test]
    fn test_call_decodes_runs_and_encodes() {
        let mut report = ReportSink::default();
        let mut state = RpcState::wrap(|arg: u16| -> u32 { u32::from(arg) * 3 });
        let mut request = vec![232, 3, 128, 0, 0xF0, 0xE0, keys::RPC_CALL_REQ, 8];
        request.extend_from_slice(&100u16.to_le_bytes());
        let mut out = [0u8; 128];
        let Verdict::Reload(len) = dest(&mut state, &mut report, "rpc_t", &request, 4, &mut out)
        else {
            panic!("expected a call response");
        };
        assert_eq!(&out[..8], &[232, 3, 128, 0, 0xF0, 0xE0, keys::RPC_CALL_RES, 8]);
        assert_eq!(&out[8..len], &300u32.to_le_bytes());
    }

    #[test]
    fn test_call_with_short_argument_is_released() {
        let mut report = ReportSink::default();
        let mut state = RpcState::wrap(|arg: u32| -> u32 { arg });
        let request = [232, 3, 128, 0, 0xF0, 0xE0, keys::RPC_CALL_REQ, 8, 1];
        let mut out = [0u8; 128];
        assert_eq!(
            dest(&mut state, &mut report, "rpc_t", &request, 4, &mut out),
            Verdict::Release
        );
        assert_eq!(report.error_count(), 1);
    }
}
