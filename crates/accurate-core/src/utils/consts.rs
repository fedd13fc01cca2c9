//! Well-known markers shared across the engine

pub const ANY: &str = "*any";
pub const DEFAULT: &str = "*default";
pub const ASAP: &str = "*asap";
pub const ZERO: &str = "*zero";
pub const USERS: &str = "*users";
pub const RAW: &str = "*raw";
pub const NONE: &str = "*none";
pub const CONCATENATED_KEY_SEP: &str = ":";
pub const TENANT_ACCOUNT_SEP: &str = ":";
pub const INFIELD_SEP: &str = ";";
pub const FALLBACK_SEP: &str = ";";
pub const META_ANY: &str = "*any";

// Directions
pub const OUT: &str = "*out";
pub const IN: &str = "*in";

// Types of record
pub const VOICE: &str = "*voice";
pub const SMS: &str = "*sms";
pub const MMS: &str = "*mms";
pub const DATA: &str = "*data";
pub const MONETARY: &str = "*monetary";
pub const GENERIC: &str = "*generic";

// Request types
pub const META_PREPAID: &str = "*prepaid";
pub const META_POSTPAID: &str = "*postpaid";
pub const META_PSEUDOPREPAID: &str = "*pseudoprepaid";
pub const META_RATED: &str = "*rated";
pub const META_NONE: &str = "*none";

// Rounding methods
pub const ROUNDING_UP: &str = "*up";
pub const ROUNDING_MIDDLE: &str = "*middle";
pub const ROUNDING_DOWN: &str = "*down";

// Max cost strategies
pub const MAX_COST_FREE: &str = "*free";
pub const MAX_COST_DISCONNECT: &str = "*disconnect";

// Contexts
pub const ALIAS_CONTEXT_RATING: &str = "*rating";

// Decimal scale used when the caller does not provide one
pub const DEFAULT_DIVISION_SCALE: u32 = 20;

// CDR field names used by filters, templates and form intake
pub const CGRID: &str = "CGRID";
pub const UNIQUE_ID: &str = "UniqueID";
pub const ORDERID: &str = "OrderID";
pub const TOR: &str = "ToR";
pub const ACCID: &str = "OriginID";
pub const CDRHOST: &str = "OriginHost";
pub const CDRSOURCE: &str = "Source";
pub const REQTYPE: &str = "RequestType";
pub const DIRECTION: &str = "Direction";
pub const TENANT: &str = "Tenant";
pub const CATEGORY: &str = "Category";
pub const ACCOUNT: &str = "Account";
pub const SUBJECT: &str = "Subject";
pub const DESTINATION: &str = "Destination";
pub const SETUP_TIME: &str = "SetupTime";
pub const PDD: &str = "PDD";
pub const ANSWER_TIME: &str = "AnswerTime";
pub const USAGE: &str = "Usage";
pub const SUPPLIER: &str = "Supplier";
pub const DISCONNECT_CAUSE: &str = "DisconnectCause";
pub const MEDI_RUNID: &str = "RunID";
pub const COST: &str = "Cost";
pub const RATED: &str = "Rated";
pub const COST_DETAILS: &str = "CostDetails";

/// Primary CDR fields, in the order used by form intake and templates
pub const PRIMARY_CDR_FIELDS: &[&str] = &[
    CGRID, UNIQUE_ID, TOR, ACCID, CDRHOST, CDRSOURCE, REQTYPE, DIRECTION, TENANT, CATEGORY,
    ACCOUNT, SUBJECT, DESTINATION, SETUP_TIME, PDD, ANSWER_TIME, USAGE, SUPPLIER,
    DISCONNECT_CAUSE, COST, RATED, MEDI_RUNID,
];
