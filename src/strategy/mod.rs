// Order planning module
pub mod ladder;
pub mod precision;

pub use ladder::{plan_ladder, LadderParams};
pub use precision::{
    adjust_price, adjust_quantity, format_decimal, truncate_amount, InstrumentSpec,
    PrecisionTable,
};
