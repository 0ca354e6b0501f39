//! Signal delivery end to end: raise during dispatch, observe the
//! callback on the loop thread.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use burrow_io::{EventBase, SignalSet, Timer};

#[test]
fn signal_raised_mid_dispatch_reaches_callback() {
    let base = EventBase::create(true).unwrap();

    let seen = Rc::new(Cell::new(0));
    let seen2 = Rc::clone(&seen);
    let base2 = base.clone();
    let mut signals = SignalSet::create(&base, move |sig| {
        seen2.set(sig);
        base2.exit();
    });
    signals.bind(libc::SIGUSR1).unwrap();

    // Raise from inside the loop so delivery goes through the pipe.
    let poker = Timer::create(&base, || unsafe {
        libc::raise(libc::SIGUSR1);
    });
    poker.set(Duration::from_millis(5));

    // Backstop so a missed signal fails the test instead of hanging it.
    let base3 = base.clone();
    let backstop = Timer::create(&base, move || base3.exit());
    backstop.set(Duration::from_secs(5));

    base.dispatch();
    assert_eq!(seen.get(), libc::SIGUSR1);
}
