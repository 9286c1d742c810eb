pub mod calc;
pub mod decision;
pub mod outlet;
pub mod product;
pub mod session;
