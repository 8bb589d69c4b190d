mod port_checker_tests;
mod readiness_tests;
