//! Application-layer key tables: vertex type keys, the sub-keys carried
//! behind `DEST`, and the scalar type keys RPC schemas advertise.

// -------------------------------------------------------- Vertex type keys

pub const VT_TYPE_ROOT: u8 = 22;
pub const VT_TYPE_ENDPOINT: u8 = 24;
pub const VT_TYPE_GENERIC: u8 = 25;
pub const VT_TYPE_RPC: u8 = 27;
pub const VT_TYPE_VPORT: u8 = 44;
pub const VT_TYPE_VBUS: u8 = 45;

// -------------------------------------------------------- Endpoint sub-keys

pub const EP_SS_ACK: u8 = 101;
pub const EP_SS_ACKLESS: u8 = 121;
pub const EP_SS_ACKED: u8 = 122;
pub const EP_QUERY: u8 = 131;
pub const EP_QUERY_RESP: u8 = 132;
pub const EP_ROUTE_QUERY_REQ: u8 = 141;
pub const EP_ROUTE_QUERY_RES: u8 = 142;
pub const EP_ROUTE_SET_REQ: u8 = 143;
pub const EP_ROUTE_SET_RES: u8 = 144;
pub const EP_ROUTE_RM_REQ: u8 = 147;
pub const EP_ROUTE_RM_RES: u8 = 148;

pub const EP_ROUTEMODE_ACKED: u8 = 167;
pub const EP_ROUTEMODE_ACKLESS: u8 = 168;

// -------------------------------------------------------- Bus sub-keys
//
// Broadcast-channel CRUD mirrors the endpoint route CRUD, with a MAP pair
// on top.

pub const VBUS_BROADCAST_QUERY_REQ: u8 = 141;
pub const VBUS_BROADCAST_QUERY_RES: u8 = 142;
pub const VBUS_BROADCAST_SET_REQ: u8 = 143;
pub const VBUS_BROADCAST_SET_RES: u8 = 144;
pub const VBUS_BROADCAST_MAP_REQ: u8 = 145;
pub const VBUS_BROADCAST_MAP_RES: u8 = 146;
pub const VBUS_BROADCAST_RM_REQ: u8 = 147;
pub const VBUS_BROADCAST_RM_RES: u8 = 148;

// -------------------------------------------------------- Root sub-keys

pub const RT_DBG_STAT: u8 = 151;
pub const RT_DBG_ERRMSG: u8 = 152;
pub const RT_DBG_DBGMSG: u8 = 153;
pub const RT_DBG_RES: u8 = 161;

// -------------------------------------------------------- RPC sub-keys

pub const RPC_INFO_REQ: u8 = 181;
pub const RPC_INFO_RES: u8 = 182;
pub const RPC_CALL_REQ: u8 = 183;
pub const RPC_CALL_RES: u8 = 184;

// -------------------------------------------------------- Scalar type keys

pub const TK_BOOL: u8 = 2;
pub const TK_UINT8: u8 = 4;
pub const TK_INT8: u8 = 5;
pub const TK_UINT16: u8 = 6;
pub const TK_INT16: u8 = 7;
pub const TK_UINT32: u8 = 8;
pub const TK_INT32: u8 = 9;
pub const TK_UINT64: u8 = 10;
pub const TK_INT64: u8 = 11;
pub const TK_FLOAT32: u8 = 26;
pub const TK_FLOAT64: u8 = 28;
