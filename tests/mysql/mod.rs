mod restart;
mod slow_log;
