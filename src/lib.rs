pub mod dw;
