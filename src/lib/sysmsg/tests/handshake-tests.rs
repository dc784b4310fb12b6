//! Models of the supervisor/stub handshake over the message state word. Run
//! natively as ordinary tests, or exhaustively with
//! `RUSTFLAGS="--cfg loom" cargo test --release`.

mod sync;

mod handshake_tests {
    use sysmsg::{EventType, Message, ThreadState};

    use super::*;

    #[test]
    fn test_stub_init_handshake() {
        sync::model(|| {
            let msg = sync::Arc::new(Message::new());
            let stub = {
                let msg = msg.clone();
                sync::thread::spawn(move || {
                    sync::rand_sleep();
                    // Stub finished initialising and is ready to run the guest.
                    msg.set_state(ThreadState::None);
                })
            };
            msg.wait_state(ThreadState::None, 0).unwrap();
            stub.join().unwrap();
            assert_eq!(msg.state(), Ok(ThreadState::None));
        })
    }

    #[test]
    fn test_dispatch_and_yield() {
        sync::model(|| {
            let msg = sync::Arc::new(Message::new());
            let stub = {
                let msg = msg.clone();
                sync::thread::spawn(move || {
                    msg.wait_state(ThreadState::Dispatched, 0).unwrap();
                    let tls = unsafe { msg.body() }.tls;
                    msg.set_state(ThreadState::None);
                    sync::rand_sleep();
                    let body = unsafe { msg.body_mut() };
                    body.set_event_type(EventType::Fault);
                    body.signo = tls as i32;
                    msg.set_state(ThreadState::Done);
                })
            };

            unsafe { msg.body_mut() }.tls = 11;
            msg.enable_sentry_fast_path();
            msg.set_state(ThreadState::Dispatched);
            msg.wait_state(ThreadState::Done, 1).unwrap();

            let body = unsafe { msg.body() };
            assert_eq!(body.event_type(), Ok(EventType::Fault));
            assert_eq!(body.signo, 11);
            stub.join().unwrap();
        })
    }

    #[test]
    fn test_interrupt_flag_visible_to_stub() {
        sync::model(|| {
            let msg = sync::Arc::new(Message::new());
            let stub = {
                let msg = msg.clone();
                sync::thread::spawn(move || {
                    msg.wait_state(ThreadState::Dispatched, 0).unwrap();
                    msg.interrupt_pending()
                })
            };
            msg.set_interrupt();
            msg.set_state(ThreadState::Dispatched);
            assert!(stub.join().unwrap());
            msg.clear_interrupt();
            assert!(!msg.interrupt_pending());
        })
    }
}
